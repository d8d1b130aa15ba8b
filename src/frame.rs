use std::sync::Arc;

use crate::detection::BBox;
use crate::error::{Error, Result};
use crate::identify::FaceObservation;
use crate::keypoint::Point;

/// A video frame: packed BGR8 pixels plus optional upstream face observations.
///
/// Frames built from replay data may carry no pixels at all; in that case
/// only `faces` is meaningful.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
    faces: Vec<FaceObservation>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "expected {} bytes for {}x{} BGR frame, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Frame { width, height, pixels: pixels.into(), faces: Vec::new() })
    }

    /// Frame without pixel data, described only by its size and faces.
    pub fn annotated(width: u32, height: u32, faces: Vec<FaceObservation>) -> Self {
        Frame { width, height, pixels: Arc::from(Vec::new()), faces }
    }

    pub fn with_faces(mut self, faces: Vec<FaceObservation>) -> Self {
        self.faces = faces;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn has_pixels(&self) -> bool {
        !self.pixels.is_empty()
    }

    pub fn faces(&self) -> &[FaceObservation] {
        &self.faces
    }

    /// Copy the region covered by `bbox`, clamped to the frame.
    ///
    /// Returns the crop origin in frame coordinates together with the crop,
    /// or `None` when the clamped region is empty. Face observations fully
    /// inside the region are kept, translated into crop coordinates.
    pub fn crop(&self, bbox: &BBox) -> Option<(Point, Frame)> {
        let clamped = bbox.clamp(self.width as i32, self.height as i32);
        if clamped.width() <= 0 || clamped.height() <= 0 {
            return None;
        }
        let origin = Point::new(clamped.x_min, clamped.y_min);
        let (w, h) = (clamped.width() as u32, clamped.height() as u32);

        let pixels: Arc<[u8]> = if self.has_pixels() {
            let stride = self.width as usize * 3;
            let row_len = w as usize * 3;
            let mut out = Vec::with_capacity(row_len * h as usize);
            for y in clamped.y_min..clamped.y_max {
                let start = y as usize * stride + clamped.x_min as usize * 3;
                out.extend_from_slice(&self.pixels[start..start + row_len]);
            }
            out.into()
        } else {
            Arc::from(Vec::new())
        };

        let faces = self
            .faces
            .iter()
            .filter(|f| clamped.contains_box(&f.bbox))
            .map(|f| FaceObservation {
                bbox: f.bbox.translate(-origin.x, -origin.y),
                embedding: f.embedding.clone(),
            })
            .collect();

        Some((origin, Frame { width: w, height: h, pixels, faces }))
    }
}
