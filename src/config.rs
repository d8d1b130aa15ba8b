use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// How an incoming bounding box is matched to an existing candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrespondencePolicy {
    /// First record (in insertion order) whose centre lies inside the box.
    FirstMatch,
    /// Among contained centres, the one closest to the box centre.
    #[default]
    NearestCenter,
    /// Highest IoU between stored and incoming boxes.
    Iou,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub keypoint_confidence_threshold: f32,
    pub arm_raise_threshold: u32,
    pub lost_threshold: u64,
    pub assistance_window_secs: u64,
    pub flush_interval_secs: u64,
    pub min_buffered_frames: usize,
    pub face_match_tolerance: f32,
    pub reconciler_workers: usize,
    pub correspondence: CorrespondencePolicy,
    /// Minimum IoU accepted by the `iou` correspondence policy.
    pub iou_threshold: f32,
    pub pose_model_path: Option<String>,
    pub face_detector_path: Option<String>,
    pub face_recognizer_path: Option<String>,
    pub device: String,
    pub database_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            keypoint_confidence_threshold: 0.60,
            arm_raise_threshold: 20,
            lost_threshold: 5,
            assistance_window_secs: 600,
            flush_interval_secs: 300,
            min_buffered_frames: 10,
            face_match_tolerance: 0.6,
            reconciler_workers: 1,
            correspondence: CorrespondencePolicy::default(),
            iou_threshold: 0.3,
            pose_model_path: None,
            face_detector_path: None,
            face_recognizer_path: None,
            device: String::from("cpu"),
            database_path: None,
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields fall back to the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.keypoint_confidence_threshold) {
            return Err(Error::Config(format!(
                "keypoint_confidence_threshold must be within [0, 1], got {}",
                self.keypoint_confidence_threshold
            )));
        }
        if self.arm_raise_threshold == 0 {
            return Err(Error::Config("arm_raise_threshold must be at least 1".into()));
        }
        if self.reconciler_workers == 0 {
            return Err(Error::Config("reconciler_workers must be at least 1".into()));
        }
        if self.face_match_tolerance.is_nan() || self.face_match_tolerance <= 0.0 {
            return Err(Error::Config(format!(
                "face_match_tolerance must be positive, got {}",
                self.face_match_tolerance
            )));
        }
        Ok(())
    }
}
