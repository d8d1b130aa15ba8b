use std::fmt;

use serde::Serialize;

use crate::detection::BBox;
use crate::identify::Identification;
use crate::keypoint::Point;

/// Session-unique candidate identity, allocated in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CandidateId(pub u64);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a resolved candidate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Identified,
    NotAStudent,
}

/// Candidate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CandidateState {
    /// Arm raised for `counter` qualifying frames, below the threshold.
    Tracking { counter: u32 },
    /// Threshold reached; identification is attempted on every qualifying frame.
    AwaitingIdentification { counter: u32 },
    Identified,
    Rejected,
    /// Terminal; the record is deleted by the next cleanup sweep.
    Completed { outcome: Resolution },
}

impl CandidateState {
    fn counted(counter: u32, threshold: u32) -> Self {
        if counter >= threshold {
            CandidateState::AwaitingIdentification { counter }
        } else {
            CandidateState::Tracking { counter }
        }
    }
}

/// One tracked person signalling intent.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub id: CandidateId,
    pub bbox: BBox,
    pub bbox_center: Point,
    pub face_center: Option<Point>,
    pub last_seen_frame: u64,
    pub state: CandidateState,
}

impl DetectionRecord {
    /// New record after the first qualifying frame (counter = 1).
    pub fn new(
        id: CandidateId,
        bbox: BBox,
        face_center: Option<Point>,
        frame_id: u64,
        threshold: u32,
    ) -> Self {
        DetectionRecord {
            id,
            bbox,
            bbox_center: bbox.center(),
            face_center,
            last_seen_frame: frame_id,
            state: CandidateState::counted(1, threshold),
        }
    }

    /// Refresh geometry and the last-seen frame.
    pub fn observe(&mut self, bbox: BBox, face_center: Option<Point>, frame_id: u64) {
        self.bbox = bbox;
        self.bbox_center = bbox.center();
        self.face_center = face_center;
        self.last_seen_frame = self.last_seen_frame.max(frame_id);
    }

    /// Count one more qualifying frame while below the threshold.
    pub fn count_raise(&mut self, threshold: u32) {
        if let CandidateState::Tracking { counter } = self.state {
            self.state = CandidateState::counted(counter + 1, threshold);
        }
    }

    /// Store an identification outcome. Only valid while awaiting one.
    pub fn apply_identification(&mut self, result: &Identification) {
        if !matches!(self.state, CandidateState::AwaitingIdentification { .. }) {
            return;
        }
        match result {
            Identification::Matched(_) => self.state = CandidateState::Identified,
            Identification::NotOnRoster => self.state = CandidateState::Rejected,
            Identification::Inconclusive => {}
        }
    }

    /// Resolved records become terminal.
    pub fn complete(&mut self) {
        self.state = match self.state {
            CandidateState::Identified => CandidateState::Completed { outcome: Resolution::Identified },
            CandidateState::Rejected => CandidateState::Completed { outcome: Resolution::NotAStudent },
            other => other,
        };
    }

    /// Counter while counting; `None` once resolved.
    pub fn arm_raised_counter(&self) -> Option<u32> {
        match self.state {
            CandidateState::Tracking { counter } | CandidateState::AwaitingIdentification { counter } => {
                Some(counter)
            }
            _ => None,
        }
    }

    /// Threshold reached (awaiting, resolved or completed).
    pub fn reached_threshold(&self) -> bool {
        !matches!(self.state, CandidateState::Tracking { .. })
    }

    pub fn awaiting_identification(&self) -> bool {
        matches!(self.state, CandidateState::AwaitingIdentification { .. })
    }

    pub fn face_scanned(&self) -> bool {
        matches!(
            self.state,
            CandidateState::Identified | CandidateState::Completed { outcome: Resolution::Identified }
        )
    }

    pub fn not_a_student(&self) -> bool {
        matches!(
            self.state,
            CandidateState::Rejected | CandidateState::Completed { outcome: Resolution::NotAStudent }
        )
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, CandidateState::Identified | CandidateState::Rejected)
    }

    pub fn detection_completed(&self) -> bool {
        matches!(self.state, CandidateState::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 20;

    fn record() -> DetectionRecord {
        DetectionRecord::new(CandidateId(1), BBox::new(100, 100, 200, 300), None, 1, THRESHOLD)
    }

    #[test]
    fn test_record_initialization() {
        let r = record();
        assert_eq!(r.bbox_center, Point::new(150, 200));
        assert_eq!(r.arm_raised_counter(), Some(1));
        assert_eq!(r.last_seen_frame, 1);
        assert!(!r.face_scanned() && !r.not_a_student() && !r.detection_completed());
    }

    #[test]
    fn test_counter_reaches_threshold() {
        let mut r = record();
        for expected in 2..THRESHOLD {
            r.count_raise(THRESHOLD);
            assert_eq!(r.state, CandidateState::Tracking { counter: expected });
        }
        r.count_raise(THRESHOLD);
        assert_eq!(r.state, CandidateState::AwaitingIdentification { counter: THRESHOLD });
        // saturates
        r.count_raise(THRESHOLD);
        assert_eq!(r.arm_raised_counter(), Some(THRESHOLD));
    }

    #[test]
    fn test_identification_outcomes() {
        let mut r = record();
        r.state = CandidateState::AwaitingIdentification { counter: THRESHOLD };
        r.apply_identification(&Identification::Inconclusive);
        assert!(r.awaiting_identification());
        r.apply_identification(&Identification::NotOnRoster);
        assert!(r.not_a_student());
        // resolved records ignore further results
        r.apply_identification(&Identification::Matched("x".into()));
        assert!(r.not_a_student() && !r.face_scanned());

        r.complete();
        assert!(r.detection_completed());
        assert!(r.not_a_student());
    }

    #[test]
    fn test_completed_is_terminal() {
        let mut r = record();
        r.state = CandidateState::Identified;
        r.complete();
        assert!(r.detection_completed() && r.face_scanned());
        r.count_raise(THRESHOLD);
        r.apply_identification(&Identification::NotOnRoster);
        r.complete();
        assert_eq!(r.state, CandidateState::Completed { outcome: Resolution::Identified });
    }

    #[test]
    fn test_tracking_cannot_complete() {
        let mut r = record();
        r.complete();
        assert!(!r.detection_completed());
    }

    #[test]
    fn test_observe_keeps_last_seen_monotonic() {
        let mut r = record();
        r.observe(BBox::new(0, 0, 10, 10), Some(Point::new(5, 2)), 8);
        assert_eq!(r.last_seen_frame, 8);
        assert_eq!(r.bbox_center, Point::new(5, 5));
        r.observe(BBox::new(0, 0, 10, 10), None, 4);
        assert_eq!(r.last_seen_frame, 8);
    }
}
