//! OpenCV glue: decoding uploaded frames and a YuNet + SFace face analyzer.

use std::sync::Mutex;

use log::{debug, warn};
use opencv::core::{Mat, Ptr, Size, Vector, CV_8UC3};
use opencv::objdetect::{FaceDetectorYN, FaceRecognizerSF};
use opencv::prelude::*;
use opencv::imgcodecs;

use crate::detection::BBox;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identify::{FaceAnalyzer, FaceEmbedding};

/// Decode a JPEG/PNG blob into a BGR frame.
pub fn decode_frame(blob: &[u8]) -> Result<Frame> {
    let buf = Vector::<u8>::from_slice(blob);
    let mat = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
    if mat.empty() {
        return Err(Error::InvalidFrame("could not decode image blob".into()));
    }
    mat_to_frame(&mat)
}

pub fn mat_to_frame(mat: &Mat) -> Result<Frame> {
    if mat.typ() != CV_8UC3 {
        return Err(Error::InvalidFrame(format!("expected an 8-bit BGR image, got type {}", mat.typ())));
    }
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone()?;
        &owned
    };
    Frame::new(mat.cols() as u32, mat.rows() as u32, mat.data_bytes()?.to_vec())
}

pub fn frame_to_mat(frame: &Frame) -> Result<Mat> {
    if !frame.has_pixels() {
        return Err(Error::InvalidFrame("frame carries no pixel data".into()));
    }
    let flat = Mat::from_slice(frame.pixels())?;
    let shaped = flat.reshape(3, frame.height() as i32)?;
    Ok(shaped.try_clone()?)
}

/// Face detection with YuNet and embeddings with SFace.
pub struct OpenCvFaceAnalyzer {
    detector: Mutex<Ptr<FaceDetectorYN>>,
    recognizer: Mutex<Ptr<FaceRecognizerSF>>,
}

impl OpenCvFaceAnalyzer {
    pub fn new(detector_path: &str, recognizer_path: &str) -> Result<Self> {
        let detector = FaceDetectorYN::create(detector_path, "", Size::new(320, 320), 0.9, 0.3, 5000, 0, 0)?;
        let recognizer = FaceRecognizerSF::create(recognizer_path, "", 0, 0)?;
        debug!("Loaded face models {} and {}", detector_path, recognizer_path);
        Ok(OpenCvFaceAnalyzer { detector: Mutex::new(detector), recognizer: Mutex::new(recognizer) })
    }

    /// One row per face: box, five landmarks and a score.
    fn detect(&self, image: &Mat) -> Result<Mat> {
        let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
        detector.set_input_size(image.size()?)?;
        let mut faces = Mat::default();
        detector.detect(image, &mut faces)?;
        Ok(faces)
    }

    fn row_box(row: &[f32]) -> BBox {
        BBox::from_f32([row[0], row[1], row[0] + row[2], row[1] + row[3]])
    }

    fn boxes(&self, frame: &Frame) -> Result<Vec<BBox>> {
        let image = frame_to_mat(frame)?;
        let faces = self.detect(&image)?;
        let mut boxes = Vec::with_capacity(faces.rows().max(0) as usize);
        for i in 0..faces.rows() {
            boxes.push(Self::row_box(faces.at_row::<f32>(i)?));
        }
        Ok(boxes)
    }

    fn encode(&self, frame: &Frame, face: &BBox) -> Result<Option<FaceEmbedding>> {
        let image = frame_to_mat(frame)?;
        let faces = self.detect(&image)?;
        let row = (0..faces.rows()).find(|&i| {
            faces
                .at_row::<f32>(i)
                .map(|r| Self::row_box(r) == *face)
                .unwrap_or(false)
        });
        let Some(row) = row else {
            return Ok(None);
        };

        let face_row = faces.row(row)?.try_clone()?;
        let mut recognizer = self.recognizer.lock().unwrap_or_else(|e| e.into_inner());
        let mut aligned = Mat::default();
        recognizer.align_crop(&image, &face_row, &mut aligned)?;
        let mut feature = Mat::default();
        recognizer.feature(&aligned, &mut feature)?;
        Ok(Some(FaceEmbedding::new(feature.data_typed::<f32>()?.to_vec())))
    }
}

impl FaceAnalyzer for OpenCvFaceAnalyzer {
    fn locate_faces(&self, frame: &Frame) -> Vec<BBox> {
        if !frame.has_pixels() {
            return Vec::new();
        }
        self.boxes(frame).unwrap_or_else(|e| {
            warn!("Face detection failed: {}", e);
            Vec::new()
        })
    }

    fn encode_face(&self, frame: &Frame, face: &BBox) -> Option<FaceEmbedding> {
        if !frame.has_pixels() {
            return None;
        }
        self.encode(frame, face).unwrap_or_else(|e| {
            warn!("Face encoding failed: {}", e);
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mat_round_trip() {
        let pixels: Vec<u8> = (0..4 * 2 * 3).map(|v| v as u8).collect();
        let frame = Frame::new(4, 2, pixels.clone()).unwrap();
        let mat = frame_to_mat(&frame).unwrap();
        assert_eq!((mat.cols(), mat.rows(), mat.channels()), (4, 2, 3));
        let back = mat_to_frame(&mat).unwrap();
        assert_eq!(back.pixels(), &pixels[..]);
    }

    #[test]
    fn test_garbage_blob_is_invalid() {
        assert!(decode_frame(&[0, 1, 2, 3]).is_err());
    }
}
