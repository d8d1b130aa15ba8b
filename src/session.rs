//! Per-session context threaded through the frame loop.

use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;

use crate::clock::{Clock, IntervalTimer, SystemClock};
use crate::config::Config;
use crate::detection::{PersonObservation, PoseEstimator};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identify::{FaceAnalyzer, FaceIdentifier, PrecomputedFaces, TemplateSet};
use crate::lifecycle::Removal;
use crate::persistence::{self, AttendanceLedger, AttendanceRow, MemoryLedger};
use crate::reconciler::{BatchReconciler, ReconcileJob};
use crate::roster::{MemoryRosterStore, Namespace, Roster, RosterEntry, RosterStore, StudentRecord};
use crate::track::DetectionRecord;
use crate::tracker::{IntentTracker, TrackEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub course_id: u64,
    pub session_count: u64,
    /// Attendance date, as handed to the ledger.
    pub date: String,
}

/// External services a session talks to.
pub struct Collaborators {
    pub store: Arc<dyn RosterStore>,
    pub analyzer: Arc<dyn FaceAnalyzer>,
    pub ledger: Arc<dyn AttendanceLedger>,
    pub clock: Box<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            store: Arc::new(MemoryRosterStore::new()),
            analyzer: Arc::new(PrecomputedFaces),
            ledger: Arc::new(MemoryLedger::new()),
            clock: Box::new(SystemClock),
        }
    }
}

/// What happened while processing one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Active records after cleanup.
    pub candidates: Vec<DetectionRecord>,
    pub events: Vec<TrackEvent>,
    pub removals: Vec<Removal>,
    pub reconciliation_launched: bool,
    pub flushed: bool,
    pub finished_assistance: bool,
}

pub struct Session {
    config: Config,
    info: SessionInfo,
    roster: Roster,
    templates: Arc<TemplateSet>,
    identifier: FaceIdentifier,
    tracker: IntentTracker,
    reconciler: Option<BatchReconciler>,
    ledger: Arc<dyn AttendanceLedger>,
    clock: Box<dyn Clock>,
    assistance_timer: IntervalTimer,
    flush_timer: IntervalTimer,
    frame_buffer: Vec<Frame>,
    frame_count: u64,
    finished_assistance: bool,
    pending_flushes: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Session {
    /// Seed the roster namespace and start the background workers.
    pub fn new(
        config: Config,
        info: SessionInfo,
        students: &[StudentRecord],
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        if students.is_empty() {
            return Err(Error::Config("no students on the roster".into()));
        }

        let Collaborators { store, analyzer, ledger, clock } = collaborators;
        let roster = Roster::new(store, Namespace::new(info.course_id, info.session_count));
        roster.seed(students)?;

        let templates = Arc::new(TemplateSet::from_students(students));
        if templates.len() < students.len() {
            warn!(
                "{} of {} students have no face template and can only be marked manually",
                students.len() - templates.len(),
                students.len()
            );
        }

        let identifier = FaceIdentifier::new(
            Arc::clone(&analyzer),
            Arc::clone(&templates),
            roster.clone(),
            config.face_match_tolerance,
        );
        let reconciler = BatchReconciler::spawn(
            config.reconciler_workers,
            analyzer,
            roster.clone(),
            config.face_match_tolerance,
        )?;

        let start = clock.now();
        info!(
            "Starting session {} of course {} with {} students",
            info.session_count,
            info.course_id,
            students.len()
        );

        Ok(Session {
            tracker: IntentTracker::new(&config),
            assistance_timer: IntervalTimer::new(Duration::from_secs(config.assistance_window_secs), start),
            flush_timer: IntervalTimer::new(Duration::from_secs(config.flush_interval_secs), start),
            frame_buffer: Vec::with_capacity(config.min_buffered_frames),
            config,
            info,
            roster,
            templates,
            identifier,
            reconciler: Some(reconciler),
            ledger,
            clock,
            frame_count: 0,
            finished_assistance: false,
            pending_flushes: Vec::new(),
            closed: false,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn records(&self) -> &[DetectionRecord] {
        self.tracker.records()
    }

    pub fn buffered_frames(&self) -> usize {
        self.frame_buffer.len()
    }

    /// Run pose estimation on `frame`, then process it.
    pub fn process_with(&mut self, frame: Frame, estimator: &dyn PoseEstimator) -> Result<FrameReport> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let persons = estimator.estimate(&frame)?;
        self.process_frame(frame, &persons)
    }

    /// Process one decoded frame and the persons detected in it.
    pub fn process_frame(&mut self, frame: Frame, persons: &[PersonObservation]) -> Result<FrameReport> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let now = self.clock.now();
        self.frame_count += 1;

        if !self.finished_assistance {
            self.finished_assistance = match self.roster.all_present() {
                Ok(done) => done,
                Err(e) => {
                    warn!("Could not check roster assistance: {}", e);
                    false
                }
            };
        }

        let mut reconciliation_launched = false;
        let min_buffered = self.config.min_buffered_frames;
        if !self.finished_assistance
            && self.assistance_timer.elapsed(now)
            && self.frame_buffer.len() >= min_buffered
        {
            self.assistance_timer.reset(now);
            info!("Getting students assistance");
            let job = ReconcileJob {
                frames: mem::take(&mut self.frame_buffer),
                templates: Arc::clone(&self.templates),
            };
            if let Some(reconciler) = &self.reconciler {
                reconciliation_launched = reconciler.submit(job);
            }
        } else if !self.finished_assistance && self.frame_buffer.len() < min_buffered {
            self.frame_buffer.push(frame.clone());
        }

        let mut flushed = false;
        if self.flush_timer.elapsed(now) {
            self.flush_timer.reset(now);
            flushed = self.flush_periodic();
        }

        let events = self.tracker.update(persons, &frame, self.frame_count, &self.identifier);
        let removals = self.tracker.cleanup(self.frame_count);

        Ok(FrameReport {
            frame_index: self.frame_count,
            candidates: self.tracker.records().to_vec(),
            events,
            removals,
            reconciliation_launched,
            flushed,
            finished_assistance: self.finished_assistance,
        })
    }

    fn flush_periodic(&mut self) -> bool {
        self.pending_flushes.retain(|h| !h.is_finished());
        let rows = match persistence::snapshot_for_flush(&self.roster) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Could not snapshot the roster for flushing: {}", e);
                return false;
            }
        };
        let handle = persistence::flush_in_background(
            Arc::clone(&self.ledger),
            self.info.course_id,
            self.info.date.clone(),
            rows,
        );
        match handle {
            Some(handle) => {
                self.pending_flushes.push(handle);
                true
            }
            None => false,
        }
    }

    /// Cancel background work, write the final counters and delete the
    /// session namespace. Returns the roster as it stood at the end.
    pub fn finish(&mut self) -> Result<Vec<RosterEntry>> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.closed = true;

        if let Some(reconciler) = self.reconciler.take() {
            let reports = reconciler.cancel();
            if reports.iter().any(|r| r.cancelled) {
                info!("Reconciliation pass cancelled at session end");
            }
        }
        for handle in self.pending_flushes.drain(..) {
            if handle.join().is_err() {
                error!("Attendance flush terminated abnormally");
            }
        }

        let entries = self.roster.entries();
        if let Ok(entries) = &entries {
            let rows: Vec<AttendanceRow> = entries.iter().map(AttendanceRow::from).collect();
            if let Err(e) = self.ledger.record(self.info.course_id, &self.info.date, &rows) {
                error!("Final attendance flush failed: {}", e);
            }
        }
        self.teardown();
        info!("Session {} of course {} finished", self.info.session_count, self.info.course_id);
        entries
    }

    fn teardown(&self) {
        if let Err(e) = self.roster.teardown() {
            error!("Failed to delete namespace {}: {}", self.roster.namespace().as_str(), e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Session dropped without finishing, discarding its namespace");
            self.reconciler.take();
            self.teardown();
        }
    }
}
