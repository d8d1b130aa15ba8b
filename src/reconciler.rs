//! Background sweep over buffered frames for roster members who never raised
//! an arm.
//!
//! Jobs are moved into a bounded pool of worker threads. The only shared
//! state they touch is the roster `assistance` flag, which only ever moves
//! from false to true.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::Result;
use crate::frame::Frame;
use crate::identify::{FaceAnalyzer, TemplateSet};
use crate::roster::{Roster, StudentId};

/// Snapshot handed to a worker.
pub struct ReconcileJob {
    pub frames: Vec<Frame>,
    pub templates: Arc<TemplateSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub frames_scanned: usize,
    pub matched: Vec<StudentId>,
    pub cancelled: bool,
}

/// Scan `job` and mark every matched, still-unmarked student present.
pub fn reconcile(
    job: &ReconcileJob,
    analyzer: &dyn FaceAnalyzer,
    roster: &Roster,
    tolerance: f32,
    cancel: &AtomicBool,
) -> ReconcileReport {
    let mut present: HashSet<StudentId> = match roster.entries() {
        Ok(entries) => entries.into_iter().filter(|e| e.assistance).map(|e| e.id).collect(),
        Err(e) => {
            warn!("Reconciler could not read the roster: {}", e);
            HashSet::new()
        }
    };

    let mut report = ReconcileReport { frames_scanned: 0, matched: Vec::new(), cancelled: false };
    for frame in &job.frames {
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            return report;
        }
        for face in analyzer.locate_faces(frame) {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                return report;
            }
            let Some(embedding) = analyzer.encode_face(frame, &face) else {
                continue;
            };
            let matched = job
                .templates
                .best_match(&embedding, tolerance, |id| !present.contains(id))
                .cloned();
            if let Some(id) = matched {
                if let Err(e) = roster.mark_present(&id) {
                    error!("Reconciler failed to mark student {} present: {}", id, e);
                }
                present.insert(id.clone());
                report.matched.push(id);
            }
        }
        report.frames_scanned += 1;
    }
    report
}

/// Bounded pool of reconciliation workers.
pub struct BatchReconciler {
    sender: Option<SyncSender<ReconcileJob>>,
    reports: Receiver<ReconcileReport>,
    workers: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

impl BatchReconciler {
    pub fn spawn(
        workers: usize,
        analyzer: Arc<dyn FaceAnalyzer>,
        roster: Roster,
        tolerance: f32,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::sync_channel::<ReconcileJob>(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        let (report_tx, reports) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = Arc::clone(&receiver);
            let report_tx = report_tx.clone();
            let cancel = Arc::clone(&cancel);
            let analyzer = Arc::clone(&analyzer);
            let roster = roster.clone();
            let handle = thread::Builder::new()
                .name(format!("reconciler-{}", i))
                .spawn(move || loop {
                    let job = match receiver.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(job) = job else {
                        debug!("Reconciler worker {} shutting down", i);
                        break;
                    };
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        reconcile(&job, analyzer.as_ref(), &roster, tolerance, &cancel)
                    }));
                    match outcome {
                        Ok(report) => {
                            info!(
                                "Reconciliation pass scanned {} frames, {} students marked present",
                                report.frames_scanned,
                                report.matched.len()
                            );
                            if report_tx.send(report).is_err() {
                                debug!("Reconciliation report dropped, receiver is gone");
                            }
                        }
                        Err(_) => error!("Reconciliation pass panicked, no matches contributed"),
                    }
                })?;
            handles.push(handle);
        }

        Ok(BatchReconciler { sender: Some(sender), reports, workers: handles, cancel })
    }

    /// Queue a pass without blocking. Returns false if the pool is saturated.
    pub fn submit(&self, job: ReconcileJob) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Reconciler busy, skipping this pass");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Reconciler workers are gone");
                false
            }
        }
    }

    /// Reports of passes finished so far.
    pub fn try_reports(&self) -> Vec<ReconcileReport> {
        self.reports.try_iter().collect()
    }

    /// Let queued passes run to completion, then stop the workers.
    pub fn finish(mut self) -> Vec<ReconcileReport> {
        self.join();
        self.reports.try_iter().collect()
    }

    /// Ask running passes to stop at the next face and stop the workers.
    /// In-flight matches already written stay written.
    pub fn cancel(mut self) -> Vec<ReconcileReport> {
        self.cancel.store(true, Ordering::Relaxed);
        self.join();
        self.reports.try_iter().collect()
    }

    fn join(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Reconciler worker terminated abnormally");
            }
        }
    }
}

impl Drop for BatchReconciler {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::identify::{FaceEmbedding, FaceObservation, PrecomputedFaces};
    use crate::roster::{MemoryRosterStore, Namespace, StudentRecord};

    fn students() -> Vec<StudentRecord> {
        vec![
            StudentRecord { id: "1".into(), name: "Ada".into(), email: String::new(), template: Some(vec![0.0, 0.0]) },
            StudentRecord { id: "2".into(), name: "Grace".into(), email: String::new(), template: Some(vec![1.0, 1.0]) },
            StudentRecord { id: "3".into(), name: "Alan".into(), email: String::new(), template: Some(vec![5.0, 5.0]) },
        ]
    }

    fn setup() -> (Roster, Arc<TemplateSet>) {
        let s = students();
        let roster = Roster::new(Arc::new(MemoryRosterStore::new()), Namespace::new(2, 4));
        roster.seed(&s).unwrap();
        (roster, Arc::new(TemplateSet::from_students(&s)))
    }

    fn frame(embeddings: &[[f32; 2]]) -> Frame {
        let faces = embeddings
            .iter()
            .enumerate()
            .map(|(i, e)| FaceObservation {
                bbox: BBox::new(i as i32 * 50, 0, i as i32 * 50 + 40, 40),
                embedding: FaceEmbedding::new(e.to_vec()),
            })
            .collect();
        Frame::annotated(640, 480, faces)
    }

    #[test]
    fn test_reconcile_marks_each_student_once() {
        let (roster, templates) = setup();
        let job = ReconcileJob {
            frames: vec![frame(&[[0.1, 0.0], [9.0, 9.0]]), frame(&[[0.0, 0.1], [1.0, 0.9]])],
            templates,
        };
        let report = reconcile(&job, &PrecomputedFaces, &roster, 0.6, &AtomicBool::new(false));

        assert_eq!(report.frames_scanned, 2);
        assert_eq!(report.matched, vec!["1".to_string(), "2".to_string()]);
        assert!(roster.is_present("1").unwrap());
        assert!(roster.is_present("2").unwrap());
        assert!(!roster.is_present("3").unwrap());
        // assistance only; participation untouched
        assert!(roster.entries().unwrap().iter().all(|e| e.participation_counter == 0));
    }

    #[test]
    fn test_already_present_students_skipped() {
        let (roster, templates) = setup();
        roster.mark_present("1").unwrap();
        let job = ReconcileJob { frames: vec![frame(&[[0.0, 0.0]])], templates };
        let report = reconcile(&job, &PrecomputedFaces, &roster, 0.6, &AtomicBool::new(false));
        assert!(report.matched.is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let (roster, templates) = setup();
        let job = ReconcileJob { frames: vec![frame(&[[0.0, 0.0]])], templates };
        let report = reconcile(&job, &PrecomputedFaces, &roster, 0.6, &AtomicBool::new(true));
        assert!(report.cancelled);
        assert_eq!(report.frames_scanned, 0);
        assert!(!roster.is_present("1").unwrap());
    }

    #[test]
    fn test_pool_runs_jobs_in_background() {
        let (roster, templates) = setup();
        let pool = BatchReconciler::spawn(2, Arc::new(PrecomputedFaces), roster.clone(), 0.6).unwrap();
        assert!(pool.submit(ReconcileJob { frames: vec![frame(&[[5.0, 5.1]])], templates }));

        let reports = pool.finish();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].matched, vec!["3".to_string()]);
        assert!(roster.is_present("3").unwrap());
    }

    struct PanickingAnalyzer;

    impl FaceAnalyzer for PanickingAnalyzer {
        fn locate_faces(&self, _: &Frame) -> Vec<BBox> {
            panic!("model crashed");
        }

        fn encode_face(&self, _: &Frame, _: &BBox) -> Option<FaceEmbedding> {
            None
        }
    }

    #[test]
    fn test_worker_failure_is_contained() {
        let (roster, templates) = setup();
        let pool = BatchReconciler::spawn(1, Arc::new(PanickingAnalyzer), roster.clone(), 0.6).unwrap();
        assert!(pool.submit(ReconcileJob { frames: vec![frame(&[[0.0, 0.0]])], templates }));
        let reports = pool.finish();
        assert!(reports.is_empty());
        assert!(!roster.all_present().unwrap());
    }
}
