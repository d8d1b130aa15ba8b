use num_traits::cast::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }
}

/// Raw joint estimate from the pose model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub const fn new(x: f32, y: f32, confidence: f32) -> Self {
        Keypoint { x, y, confidence }
    }
}

impl From<[f32; 3]> for Keypoint {
    fn from(v: [f32; 3]) -> Self {
        Keypoint::new(v[0], v[1], v[2])
    }
}

impl From<Keypoint> for [f32; 3] {
    fn from(k: Keypoint) -> Self {
        [k.x, k.y, k.confidence]
    }
}

/// Number of keypoints consumed per person (COCO order, head and arms only).
pub const NUM_KEYPOINTS: usize = 11;

/// Index of each consumed joint inside a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
}

pub const FACE_KEYPOINTS: [KeypointIndex; 5] = [
    KeypointIndex::Nose,
    KeypointIndex::LeftEye,
    KeypointIndex::RightEye,
    KeypointIndex::LeftEar,
    KeypointIndex::RightEar,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// Confidence gate turning raw keypoints into present/absent coordinates.
#[derive(Debug, Clone, Copy)]
pub struct KeypointFilter {
    threshold: f32,
}

impl Default for KeypointFilter {
    fn default() -> Self {
        KeypointFilter { threshold: 0.60 }
    }
}

impl KeypointFilter {
    pub fn new(threshold: f32) -> Self {
        KeypointFilter { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Coordinates truncated to pixels when `confidence > threshold`.
    /// Non-finite coordinates are treated as absent.
    pub fn filter(&self, keypoint: &Keypoint) -> Option<Point> {
        if !(keypoint.confidence > self.threshold) {
            return None;
        }
        let x = keypoint.x.to_i32()?;
        let y = keypoint.y.to_i32()?;
        Some(Point::new(x, y))
    }
}

/// Shoulder, elbow and wrist of one side after filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm {
    pub shoulder: Option<Point>,
    pub elbow: Option<Point>,
    pub wrist: Option<Point>,
}

/// The filtered joints the geometry engine works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilteredPose {
    pub face: [Option<Point>; 5],
    pub left_arm: Arm,
    pub right_arm: Arm,
}

impl FilteredPose {
    pub fn from_keypoints(keypoints: &[Keypoint; NUM_KEYPOINTS], filter: &KeypointFilter) -> Self {
        let get = |idx: KeypointIndex| filter.filter(&keypoints[idx as usize]);
        FilteredPose {
            face: FACE_KEYPOINTS.map(get),
            left_arm: Arm {
                shoulder: get(KeypointIndex::LeftShoulder),
                elbow: get(KeypointIndex::LeftElbow),
                wrist: get(KeypointIndex::LeftWrist),
            },
            right_arm: Arm {
                shoulder: get(KeypointIndex::RightShoulder),
                elbow: get(KeypointIndex::RightElbow),
                wrist: get(KeypointIndex::RightWrist),
            },
        }
    }

    pub fn arm(&self, side: Side) -> &Arm {
        match side {
            Side::Left => &self.left_arm,
            Side::Right => &self.right_arm,
        }
    }
}
