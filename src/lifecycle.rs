use log::{info, warn};
use serde::Serialize;

use crate::track::{CandidateId, DetectionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    NotAStudent,
    Completed,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub id: CandidateId,
    pub reason: RemovalReason,
}

/// Garbage collection of finished and stale records, run once per frame.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleManager {
    lost_threshold: u64,
}

impl LifecycleManager {
    pub fn new(lost_threshold: u64) -> Self {
        LifecycleManager { lost_threshold }
    }

    pub fn removal_reason(&self, record: &DetectionRecord, frame_count: u64) -> Option<RemovalReason> {
        if record.detection_completed() && record.not_a_student() {
            Some(RemovalReason::NotAStudent)
        } else if record.detection_completed() {
            Some(RemovalReason::Completed)
        } else if frame_count.saturating_sub(record.last_seen_frame) > self.lost_threshold {
            Some(RemovalReason::Lost)
        } else {
            None
        }
    }

    /// Remove every record that is completed or unseen for too long,
    /// keeping the insertion order of the survivors.
    pub fn sweep(&self, records: &mut Vec<DetectionRecord>, frame_count: u64) -> Vec<Removal> {
        let mut removals = Vec::new();
        records.retain(|record| match self.removal_reason(record, frame_count) {
            Some(reason) => {
                match reason {
                    RemovalReason::NotAStudent => {
                        info!("Detection {} is not a student, deleting detection", record.id)
                    }
                    RemovalReason::Completed => info!("Detection {} completed, deleting detection", record.id),
                    RemovalReason::Lost => warn!("Detection {} removed due to prolonged absence", record.id),
                }
                removals.push(Removal { id: record.id, reason });
                false
            }
            None => true,
        });
        removals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::track::CandidateState;

    fn record(id: u64, last_seen: u64, state: CandidateState) -> DetectionRecord {
        let mut r = DetectionRecord::new(CandidateId(id), BBox::new(0, 0, 10, 10), None, last_seen, 20);
        r.state = state;
        r
    }

    #[test]
    fn test_lost_threshold_boundary() {
        let manager = LifecycleManager::new(5);
        let mut records = vec![record(1, 10, CandidateState::Tracking { counter: 3 })];

        assert!(manager.sweep(&mut records, 15).is_empty());
        assert_eq!(records.len(), 1);

        let removed = manager.sweep(&mut records, 16);
        assert_eq!(removed, vec![Removal { id: CandidateId(1), reason: RemovalReason::Lost }]);
        assert!(records.is_empty());
    }

    #[test]
    fn test_completed_removed_with_reason() {
        let manager = LifecycleManager::new(5);
        let mut rejected = record(1, 9, CandidateState::Rejected);
        rejected.complete();
        let mut identified = record(2, 9, CandidateState::Identified);
        identified.complete();
        let mut records = vec![
            rejected,
            identified,
            record(3, 9, CandidateState::Identified),
            record(4, 9, CandidateState::AwaitingIdentification { counter: 20 }),
        ];

        let removed = manager.sweep(&mut records, 10);
        assert_eq!(
            removed,
            vec![
                Removal { id: CandidateId(1), reason: RemovalReason::NotAStudent },
                Removal { id: CandidateId(2), reason: RemovalReason::Completed },
            ]
        );
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![CandidateId(3), CandidateId(4)]);
    }

    #[test]
    fn test_record_seen_this_frame_survives() {
        let manager = LifecycleManager::new(5);
        let mut records = vec![record(1, 100, CandidateState::Tracking { counter: 1 })];
        assert!(manager.sweep(&mut records, 100).is_empty());
        assert_eq!(records.len(), 1);
    }
}
