use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::Stage;

/// Which operand of a verification request an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Probe,
    Reference,
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Probe => f.write_str("probe"),
            Operand::Reference => f.write_str("reference"),
        }
    }
}

/// Errors raised by a detection capability.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("detector returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Errors surfaced by the verification pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error(
        "insufficient frames: {available} extractable from a {duration_secs:.2}s clip, need {required}"
    )]
    InsufficientFrames {
        available: usize,
        required: usize,
        duration_secs: f64,
    },

    #[error("insufficient valid frames for liveness: {valid} with a face, need {required}")]
    InsufficientValidFrames { valid: usize, required: usize },

    #[error("insufficient valid frames for aggregation: {valid} with a face, need {required}")]
    InsufficientFramesForAggregation { valid: usize, required: usize },

    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("verification timed out during {stage} after {elapsed_ms} ms")]
    Timeout { stage: Stage, elapsed_ms: u64 },

    #[error("detection capability unavailable: {0}")]
    DetectionUnavailable(String),

    #[error("detector error: {0}")]
    Detector(DetectorError),

    #[error("no face detected in {operand} image")]
    NoFaceDetected { operand: Operand },

    #[error("aggregated embedding of {frames} frames has zero norm")]
    DegenerateAggregate { frames: usize },

    #[error("invalid frame record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },
}

impl VerifyError {
    /// Stable machine-readable tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::InsufficientFrames { .. } => "insufficient_frames",
            VerifyError::InsufficientValidFrames { .. } => "insufficient_valid_frames",
            VerifyError::InsufficientFramesForAggregation { .. } => {
                "insufficient_frames_for_aggregation"
            }
            VerifyError::DimensionMismatch { .. } => "dimension_mismatch",
            VerifyError::Timeout { .. } => "timeout",
            VerifyError::DetectionUnavailable(_) => "detection_unavailable",
            VerifyError::Detector(_) => "detector",
            VerifyError::NoFaceDetected { .. } => "no_face_detected",
            VerifyError::DegenerateAggregate { .. } => "degenerate_aggregate",
            VerifyError::InvalidRecord { .. } => "invalid_record",
        }
    }

    /// Only timeouts may be retried with a fresh request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VerifyError::Timeout { .. })
    }
}

impl From<DetectorError> for VerifyError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Unavailable(reason) => VerifyError::DetectionUnavailable(reason),
            other => VerifyError::Detector(other),
        }
    }
}
