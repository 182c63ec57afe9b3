//! Request-scoped value types shared by every pipeline stage.

use serde::{Deserialize, Serialize};

use crate::error::VerifyError;

/// How far a recorded embedding's L2 norm may stray from 1.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Five-point facial landmarks: left eye, right eye, nose, left and right
/// mouth corners.
pub type Landmarks = [(f32, f32); 5];

/// Raster size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned face box in pixel coordinates, `(x1, y1)` top-left and
/// `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Face embedding produced by the detection capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Dot product. Callers must check dimensions first.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Unit L2 norm within [`UNIT_NORM_TOLERANCE`].
    pub fn is_unit(&self) -> bool {
        self.is_finite() && (self.l2_norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Scale to unit L2 norm. Returns `None` for a zero or non-finite norm.
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.l2_norm();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        Some(Embedding {
            values: self.values.iter().map(|v| v / norm).collect(),
        })
    }
}

/// A face found in one frame. Only faces that were actually detected are
/// represented; an empty frame has no observation at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub landmarks: Option<Landmarks>,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    /// Unit-norm identity embedding.
    pub embedding: Embedding,
}

impl FaceObservation {
    /// Reject observations the comparator cannot score meaningfully:
    /// a non-finite confidence or an embedding that is not unit-norm.
    pub fn validate(&self, index: usize) -> Result<(), VerifyError> {
        if !self.confidence.is_finite() {
            return Err(VerifyError::InvalidRecord {
                index,
                reason: "confidence is not finite".to_string(),
            });
        }
        if !self.embedding.is_unit() {
            return Err(VerifyError::InvalidRecord {
                index,
                reason: format!(
                    "embedding norm {} is not 1 (within {UNIT_NORM_TOLERANCE})",
                    self.embedding.l2_norm()
                ),
            });
        }
        Ok(())
    }
}

/// Detection outcome for one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Ordinal position in the sampled sequence.
    pub index: usize,
    #[serde(default)]
    pub observation: Option<FaceObservation>,
}

impl FrameRecord {
    pub fn is_present(&self) -> bool {
        self.observation.is_some()
    }
}

/// The observations of frames that contain a face, in sampled order.
pub(crate) fn valid_observations(records: &[FrameRecord]) -> Vec<&FaceObservation> {
    records
        .iter()
        .filter_map(|record| record.observation.as_ref())
        .collect()
}
