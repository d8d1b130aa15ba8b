//! Face-based identification of candidates against the roster.

use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::detection::BBox;
use crate::frame::Frame;
use crate::keypoint::Point;
use crate::roster::{Roster, StudentId, StudentRecord};

/// Fixed-length face descriptor produced by the face encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceEmbedding(Vec<f32>);

impl FaceEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        FaceEmbedding(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance. Embeddings of different length never match.
    pub fn distance(&self, other: &FaceEmbedding) -> Option<f32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let sum: f32 = self
            .0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        Some(sum.sqrt())
    }
}

/// A face located (and encoded) upstream, carried along with a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BBox,
    pub embedding: FaceEmbedding,
}

/// Face detector + encoder. Boxes are in the coordinates of the given frame.
pub trait FaceAnalyzer: Send + Sync {
    fn locate_faces(&self, frame: &Frame) -> Vec<BBox>;
    fn encode_face(&self, frame: &Frame, face: &BBox) -> Option<FaceEmbedding>;
}

/// Uses the face observations already attached to each frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputedFaces;

impl FaceAnalyzer for PrecomputedFaces {
    fn locate_faces(&self, frame: &Frame) -> Vec<BBox> {
        frame.faces().iter().map(|f| f.bbox).collect()
    }

    fn encode_face(&self, frame: &Frame, face: &BBox) -> Option<FaceEmbedding> {
        frame
            .faces()
            .iter()
            .find(|f| f.bbox == *face)
            .map(|f| f.embedding.clone())
    }
}

/// Index of the first template within `tolerance` of `embedding`.
pub fn compare<'a>(
    embedding: &FaceEmbedding,
    templates: impl IntoIterator<Item = &'a FaceEmbedding>,
    tolerance: f32,
) -> Option<usize> {
    templates
        .into_iter()
        .position(|t| embedding.distance(t).is_some_and(|d| d <= tolerance))
}

/// Enrolment templates, in roster order.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    entries: Vec<(StudentId, FaceEmbedding)>,
}

impl TemplateSet {
    pub fn from_students(students: &[StudentRecord]) -> Self {
        let entries = students
            .iter()
            .filter_map(|s| {
                s.template
                    .as_ref()
                    .map(|t| (s.id.clone(), FaceEmbedding::new(t.clone())))
            })
            .collect();
        TemplateSet { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(StudentId, FaceEmbedding)> {
        self.entries.iter()
    }

    /// First student among those accepted by `eligible` whose template matches.
    pub fn best_match(
        &self,
        embedding: &FaceEmbedding,
        tolerance: f32,
        mut eligible: impl FnMut(&str) -> bool,
    ) -> Option<&StudentId> {
        let candidates: Vec<&(StudentId, FaceEmbedding)> =
            self.entries.iter().filter(|(id, _)| eligible(id)).collect();
        compare(embedding, candidates.iter().map(|(_, t)| t), tolerance)
            .map(|idx| &candidates[idx].0)
    }
}

/// Outcome of one identification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Identification {
    Matched(StudentId),
    /// A face was encoded but nobody on the roster matched it.
    NotOnRoster,
    /// No usable face under the candidate's face centre; retry later.
    Inconclusive,
}

impl Identification {
    /// `(matched, rejected_as_non_roster)`.
    pub fn flags(&self) -> (bool, bool) {
        match self {
            Identification::Matched(_) => (true, false),
            Identification::NotOnRoster => (false, true),
            Identification::Inconclusive => (false, false),
        }
    }
}

pub trait IdentificationGateway {
    fn identify(&self, frame: &Frame, bbox: &BBox, face_center: Option<Point>) -> Identification;
}

/// Identifies the face under a candidate's face centre against the templates
/// of roster members not yet marked present.
pub struct FaceIdentifier {
    analyzer: Arc<dyn FaceAnalyzer>,
    templates: Arc<TemplateSet>,
    roster: Roster,
    tolerance: f32,
}

impl FaceIdentifier {
    pub fn new(
        analyzer: Arc<dyn FaceAnalyzer>,
        templates: Arc<TemplateSet>,
        roster: Roster,
        tolerance: f32,
    ) -> Self {
        FaceIdentifier { analyzer, templates, roster, tolerance }
    }

    fn is_unmarked(&self, id: &str) -> bool {
        match self.roster.is_present(id) {
            Ok(present) => !present,
            Err(e) => {
                warn!("Could not read assistance of student {}: {}", id, e);
                true
            }
        }
    }
}

impl IdentificationGateway for FaceIdentifier {
    fn identify(&self, frame: &Frame, bbox: &BBox, face_center: Option<Point>) -> Identification {
        let Some(center) = face_center else {
            return Identification::Inconclusive;
        };
        let Some((origin, crop)) = frame.crop(bbox) else {
            return Identification::Inconclusive;
        };

        let faces = self.analyzer.locate_faces(&crop);
        let face = faces
            .iter()
            .find(|f| f.translate(origin.x, origin.y).contains(center));
        let Some(face) = face else {
            info!("No face under the candidate's face centre, scanning again on the next frame");
            return Identification::Inconclusive;
        };
        let Some(embedding) = self.analyzer.encode_face(&crop, face) else {
            return Identification::Inconclusive;
        };

        let matched = self
            .templates
            .best_match(&embedding, self.tolerance, |id| self.is_unmarked(id))
            .cloned();
        let Some(student_id) = matched else {
            info!("Got no matches from the roster, this person is not a student");
            return Identification::NotOnRoster;
        };

        let name = self.roster.name(&student_id).ok().flatten().unwrap_or_default();
        info!("Student {} ({}) has participated", name, student_id);
        if let Err(e) = self.roster.mark_present(&student_id) {
            error!("Failed to mark student {} present: {}", student_id, e);
        }
        if let Err(e) = self.roster.record_participation(&student_id) {
            error!("Failed to record participation of student {}: {}", student_id, e);
        }
        Identification::Matched(student_id)
    }
}
