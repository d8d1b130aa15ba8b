pub mod clock;
pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod identify;
pub mod keypoint;
pub mod lifecycle;
pub mod persistence;
pub mod reconciler;
pub mod replay;
pub mod roster;
pub mod session;
pub mod track;
pub mod tracker;
pub mod utils;

#[cfg(feature = "opencv")]
pub mod opencv_backend;
#[cfg(feature = "opencv")]
pub mod visualization;

// Re-export main types
pub use crate::config::Config;
pub use crate::detection::{BBox, PersonObservation, PoseEstimator};
pub use crate::error::{Error, Result};
pub use crate::frame::Frame;
pub use crate::identify::{FaceAnalyzer, Identification, IdentificationGateway};
pub use crate::roster::{Roster, RosterEntry, RosterStore, StudentRecord};
pub use crate::session::{Collaborators, FrameReport, Session, SessionInfo};
pub use crate::track::{CandidateId, CandidateState, DetectionRecord};
pub use crate::tracker::IntentTracker;
