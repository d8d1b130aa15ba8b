//! Candidate correspondence and the per-frame record state machine.

use log::{debug, info};
use serde::Serialize;

use crate::config::{Config, CorrespondencePolicy};
use crate::detection::{BBox, PersonObservation};
use crate::frame::Frame;
use crate::geometry::{self, ArmSignal};
use crate::identify::{Identification, IdentificationGateway};
use crate::keypoint::{FilteredPose, KeypointFilter};
use crate::lifecycle::{LifecycleManager, Removal};
use crate::track::{CandidateId, DetectionRecord};
use crate::utils;

/// Chooses which active record (if any) an incoming box belongs to.
pub trait CorrespondenceStrategy: Send {
    /// Index into `records` (insertion order) of the matched record.
    fn select(&self, bbox: &BBox, records: &[DetectionRecord]) -> Option<usize>;
}

/// First record, in insertion order, whose stored centre lies inside the box.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMatch;

impl CorrespondenceStrategy for FirstMatch {
    fn select(&self, bbox: &BBox, records: &[DetectionRecord]) -> Option<usize> {
        records.iter().position(|r| bbox.contains(r.bbox_center))
    }
}

/// Among records whose centre lies inside the box, the one whose centre is
/// closest to the box centre. Ties go to the older record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestCenter;

impl CorrespondenceStrategy for NearestCenter {
    fn select(&self, bbox: &BBox, records: &[DetectionRecord]) -> Option<usize> {
        let center = bbox.center();
        records
            .iter()
            .enumerate()
            .filter(|(_, r)| bbox.contains(r.bbox_center))
            .min_by_key(|(_, r)| utils::distance_sq(r.bbox_center, center))
            .map(|(idx, _)| idx)
    }
}

/// Highest IoU between stored and incoming boxes, above a floor.
#[derive(Debug, Clone, Copy)]
pub struct IouMatch {
    pub threshold: f32,
}

impl CorrespondenceStrategy for IouMatch {
    fn select(&self, bbox: &BBox, records: &[DetectionRecord]) -> Option<usize> {
        records
            .iter()
            .enumerate()
            .map(|(idx, r)| (idx, utils::compute_iou(&r.bbox, bbox)))
            .filter(|(_, iou)| *iou >= self.threshold)
            .min_by(|a, b| b.1.total_cmp(&a.1))
            .map(|(idx, _)| idx)
    }
}

pub fn strategy_for(policy: CorrespondencePolicy, iou_threshold: f32) -> Box<dyn CorrespondenceStrategy> {
    match policy {
        CorrespondencePolicy::FirstMatch => Box::new(FirstMatch),
        CorrespondencePolicy::NearestCenter => Box::new(NearestCenter),
        CorrespondencePolicy::Iou => Box::new(IouMatch { threshold: iou_threshold }),
    }
}

/// Assigns identities to boxes without a motion model.
pub struct CandidateTracker {
    strategy: Box<dyn CorrespondenceStrategy>,
    next_id: u64,
}

impl CandidateTracker {
    pub fn new(strategy: Box<dyn CorrespondenceStrategy>) -> Self {
        CandidateTracker { strategy, next_id: 1 }
    }

    /// Identity of the record matching `bbox`, or a freshly minted one.
    pub fn resolve(&mut self, bbox: &BBox, records: &[DetectionRecord]) -> (CandidateId, bool) {
        match self.strategy.select(bbox, records) {
            Some(idx) => (records[idx].id, false),
            None => {
                let id = CandidateId(self.next_id);
                self.next_id += 1;
                (id, true)
            }
        }
    }
}

/// Something that happened to a record during one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackEvent {
    Created { id: CandidateId },
    Identification { id: CandidateId, result: Identification },
    Completed { id: CandidateId },
}

/// Owns the active record set of a session.
pub struct IntentTracker {
    filter: KeypointFilter,
    candidates: CandidateTracker,
    lifecycle: LifecycleManager,
    arm_raise_threshold: u32,
    records: Vec<DetectionRecord>,
}

impl IntentTracker {
    pub fn new(config: &Config) -> Self {
        IntentTracker {
            filter: KeypointFilter::new(config.keypoint_confidence_threshold),
            candidates: CandidateTracker::new(strategy_for(config.correspondence, config.iou_threshold)),
            lifecycle: LifecycleManager::new(config.lost_threshold),
            arm_raise_threshold: config.arm_raise_threshold,
            records: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn CorrespondenceStrategy>) -> Self {
        self.candidates = CandidateTracker::new(strategy);
        self
    }

    /// Active records in insertion order.
    pub fn records(&self) -> &[DetectionRecord] {
        &self.records
    }

    pub fn record(&self, id: CandidateId) -> Option<&DetectionRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Apply every person observed in `frame` to the record set.
    pub fn update(
        &mut self,
        persons: &[PersonObservation],
        frame: &Frame,
        frame_id: u64,
        gateway: &dyn IdentificationGateway,
    ) -> Vec<TrackEvent> {
        let mut events = Vec::new();
        for person in persons {
            self.step(person, frame, frame_id, gateway, &mut events);
        }
        events
    }

    fn step(
        &mut self,
        person: &PersonObservation,
        frame: &Frame,
        frame_id: u64,
        gateway: &dyn IdentificationGateway,
        events: &mut Vec<TrackEvent>,
    ) {
        let pose = FilteredPose::from_keypoints(&person.keypoints, &self.filter);
        let analysis = geometry::analyze(&pose);
        let bbox = person.bbox;
        let (id, is_new) = self.candidates.resolve(&bbox, &self.records);

        if analysis.signal == ArmSignal::Both {
            debug!("Both arms raised for {}, treated as no signal", id);
        }

        if analysis.signal.is_active() {
            if is_new {
                self.records.push(DetectionRecord::new(
                    id,
                    bbox,
                    analysis.face_center,
                    frame_id,
                    self.arm_raise_threshold,
                ));
                events.push(TrackEvent::Created { id });
                return;
            }
            let threshold = self.arm_raise_threshold;
            let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
                return;
            };
            record.observe(bbox, analysis.face_center, frame_id);
            if record.awaiting_identification() {
                let result = identify(record, frame, gateway);
                events.push(TrackEvent::Identification { id, result });
            } else {
                record.count_raise(threshold);
            }
        } else if !is_new {
            let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
                return;
            };
            if record.detection_completed() || !record.reached_threshold() {
                return;
            }
            record.observe(bbox, analysis.face_center, frame_id);
            if record.is_resolved() {
                record.complete();
                events.push(TrackEvent::Completed { id });
            } else {
                let result = identify(record, frame, gateway);
                events.push(TrackEvent::Identification { id, result });
            }
        }
    }

    /// Drop completed and lost records.
    pub fn cleanup(&mut self, frame_count: u64) -> Vec<Removal> {
        self.lifecycle.sweep(&mut self.records, frame_count)
    }
}

fn identify(record: &mut DetectionRecord, frame: &Frame, gateway: &dyn IdentificationGateway) -> Identification {
    info!("Detection {} - getting face recognition", record.id);
    let result = gateway.identify(frame, &record.bbox, record.face_center);
    record.apply_identification(&result);
    result
}
