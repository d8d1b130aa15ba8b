use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frame::Frame;
use crate::keypoint::{Keypoint, Point, NUM_KEYPOINTS};

/// Axis-aligned box in integer pixel coordinates, corner format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BBox {
    pub const fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        BBox { x_min, y_min, x_max, y_max }
    }

    /// Truncate model output toward zero.
    pub fn from_f32(v: [f32; 4]) -> Self {
        BBox::new(v[0] as i32, v[1] as i32, v[2] as i32, v[3] as i32)
    }

    /// Integer midpoint.
    pub fn center(&self) -> Point {
        let mid = |a: i32, b: i32| (i64::from(a) + i64::from(b)).div_euclid(2) as i32;
        Point::new(mid(self.x_min, self.x_max), mid(self.y_min, self.y_max))
    }

    /// Inclusive on all four sides.
    pub fn contains(&self, p: Point) -> bool {
        self.x_min <= p.x && p.x <= self.x_max && self.y_min <= p.y && p.y <= self.y_max
    }

    pub fn contains_box(&self, other: &BBox) -> bool {
        self.x_min <= other.x_min
            && self.y_min <= other.y_min
            && other.x_max <= self.x_max
            && other.y_max <= self.y_max
    }

    pub fn width(&self) -> i32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> i32 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn area(&self) -> i64 {
        let w = (i64::from(self.x_max) - i64::from(self.x_min)).max(0);
        let h = (i64::from(self.y_max) - i64::from(self.y_min)).max(0);
        w.saturating_mul(h)
    }

    pub fn clamp(&self, width: i32, height: i32) -> BBox {
        BBox::new(
            self.x_min.clamp(0, width),
            self.y_min.clamp(0, height),
            self.x_max.clamp(0, width),
            self.y_max.clamp(0, height),
        )
    }

    pub fn translate(&self, dx: i32, dy: i32) -> BBox {
        BBox::new(
            self.x_min.saturating_add(dx),
            self.y_min.saturating_add(dy),
            self.x_max.saturating_add(dx),
            self.y_max.saturating_add(dy),
        )
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        BBox::from_f32(v)
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        [b.x_min, b.y_min, b.x_max, b.y_max]
    }
}

/// One detected person: head/arm keypoints and a bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonObservation {
    pub keypoints: [Keypoint; NUM_KEYPOINTS],
    pub bbox: BBox,
}

impl PersonObservation {
    pub fn new(keypoints: [Keypoint; NUM_KEYPOINTS], bbox: BBox) -> Self {
        PersonObservation { keypoints, bbox }
    }
}

/// Source of per-frame poses (the pose-estimation model).
pub trait PoseEstimator {
    fn estimate(&self, frame: &Frame) -> Result<Vec<PersonObservation>>;
}

#[cfg(feature = "torch")]
pub use torch::TorchPoseEstimator;

#[cfg(feature = "torch")]
mod torch {
    use log::debug;
    use tch::{Device, Kind, Tensor};

    use super::{BBox, PersonObservation, PoseEstimator};
    use crate::error::{Error, Result};
    use crate::frame::Frame;
    use crate::keypoint::{Keypoint, NUM_KEYPOINTS};
    use crate::utils;

    /// Channels per anchor in a YOLOv8-pose head: cx, cy, w, h, conf, 17 x (x, y, c).
    const POSE_CHANNELS: usize = 5 + 17 * 3;

    /// Wraps a TorchScript export of a YOLOv8-pose model.
    pub struct TorchPoseEstimator {
        model: tch::CModule,
        device: Device,
        input_size: (i64, i64),
        pub conf_threshold: f32,
        pub nms_threshold: f32,
    }

    impl TorchPoseEstimator {
        /// Load a model file on `device` ("cpu"/"cuda").
        pub fn new(model_path: &str, device: &str, input_size: (i64, i64)) -> Result<Self> {
            let device = if device == "cuda" && tch::Cuda::is_available() {
                Device::Cuda(0)
            } else {
                Device::Cpu
            };
            let mut model = tch::CModule::load_on_device(model_path, device)?;
            model.set_eval();
            Ok(TorchPoseEstimator {
                model,
                device,
                input_size,
                conf_threshold: 0.25,
                nms_threshold: 0.45,
            })
        }

        /// BGR bytes -> normalised RGB `[1, 3, H, W]` at the model input size.
        fn preprocess(&self, frame: &Frame) -> Result<Tensor> {
            if !frame.has_pixels() {
                return Err(Error::InvalidFrame("frame has no pixel data".into()));
            }
            let (w, h) = (i64::from(frame.width()), i64::from(frame.height()));
            let tensor = Tensor::from_slice(frame.pixels())
                .reshape([h, w, 3])
                .permute([2, 0, 1])
                .flip([0])
                .to_kind(Kind::Float)
                / 255.0;
            let resized = tensor.unsqueeze(0).upsample_bilinear2d(
                [self.input_size.1, self.input_size.0],
                false,
                None::<f64>,
                None::<f64>,
            );
            Ok(resized.to_device(self.device))
        }

        fn postprocess(&self, output: &Tensor, frame: &Frame) -> Result<Vec<PersonObservation>> {
            let size = output.size();
            if size.len() != 3 || size[1] as usize != POSE_CHANNELS {
                return Err(Error::Backend(format!("unexpected pose output shape {:?}", size)));
            }
            let anchors = size[2] as usize;
            let rows = output
                .squeeze_dim(0)
                .transpose(0, 1)
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view([-1]);
            let data = Vec::<f32>::try_from(&rows)?;

            let scale_x = frame.width() as f32 / self.input_size.0 as f32;
            let scale_y = frame.height() as f32 / self.input_size.1 as f32;

            let mut persons = Vec::new();
            let mut scores = Vec::new();
            for row in data.chunks_exact(POSE_CHANNELS).take(anchors) {
                let conf = row[4];
                if conf < self.conf_threshold {
                    continue;
                }
                let (cx, cy, bw, bh) = (row[0] * scale_x, row[1] * scale_y, row[2] * scale_x, row[3] * scale_y);
                let bbox = BBox::from_f32([cx - bw / 2.0, cy - bh / 2.0, cx + bw / 2.0, cy + bh / 2.0]);
                let keypoints: [Keypoint; NUM_KEYPOINTS] = std::array::from_fn(|i| {
                    let k = &row[5 + i * 3..5 + i * 3 + 3];
                    Keypoint::new(k[0] * scale_x, k[1] * scale_y, k[2])
                });
                persons.push(PersonObservation::new(keypoints, bbox));
                scores.push(conf);
            }

            let boxes: Vec<BBox> = persons.iter().map(|p| p.bbox).collect();
            let keep = utils::nms(&boxes, &scores, self.nms_threshold);
            debug!("{} pose candidates, {} after NMS", persons.len(), keep.len());
            Ok(keep.into_iter().map(|i| persons[i].clone()).collect())
        }
    }

    impl PoseEstimator for TorchPoseEstimator {
        fn estimate(&self, frame: &Frame) -> Result<Vec<PersonObservation>> {
            let input = self.preprocess(frame)?;
            let output = tch::no_grad(|| self.model.forward_ts(&[input]))?;
            self.postprocess(&output, frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center_inside_own_box() {
        for b in [
            BBox::new(0, 0, 10, 10),
            BBox::new(3, 7, 4, 8),
            BBox::new(-20, -20, -5, -1),
            BBox::new(5, 5, 5, 5),
        ] {
            assert!(b.contains(b.center()), "{:?}", b);
        }
        assert_eq!(BBox::new(0, 0, 11, 7).center(), Point::new(5, 3));
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        let far = BBox::from_f32([3e9, 3e9, 3e9, 3e9]);
        assert_eq!(far, BBox::new(i32::MAX, i32::MAX, i32::MAX, i32::MAX));
        assert!(far.contains(far.center()));
        assert_eq!(far.area(), 0);

        let full = BBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(full.center(), Point::new(-1, -1));
        assert!(full.contains(full.center()));
        assert_eq!(full.width(), i32::MAX);
        assert!(full.area() > 0);
        assert_eq!(full.translate(i32::MAX, 0).x_max, i32::MAX);
    }

    #[test]
    fn test_contains_inclusive() {
        let b = BBox::new(10, 10, 20, 20);
        assert!(b.contains(Point::new(10, 10)));
        assert!(b.contains(Point::new(20, 20)));
        assert!(!b.contains(Point::new(21, 15)));
        assert!(!b.contains(Point::new(15, 9)));
    }

    #[test]
    fn test_observation_from_json() {
        let json = r#"{
            "keypoints": [[1,2,0.9],[1,2,0.9],[1,2,0.9],[1,2,0.9],[1,2,0.9],[1,2,0.9],
                          [1,2,0.9],[1,2,0.9],[1,2,0.9],[1,2,0.9],[1,2,0.1]],
            "bbox": [10.7, 20.2, 110.9, 220.5]
        }"#;
        let obs: PersonObservation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.bbox, BBox::new(10, 20, 110, 220));
        assert_eq!(obs.keypoints[10].confidence, 0.1);
    }
}
