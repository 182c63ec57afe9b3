//! Multi-signal liveness decision over a sampled clip.
//!
//! Four independent checks run over the frames in which a face was found,
//! in sampled order. Each targets a different presentation attack:
//!
//! - **Face consistency**: the minimum cosine similarity between
//!   consecutive embeddings. A face swap mid-clip produces one dissimilar
//!   transition, and one is enough to fail.
//! - **Motion**: the largest centroid displacement between consecutive
//!   boxes. A photo held to the camera barely moves.
//! - **Size variation**: coefficient of variation of box area. A live
//!   subject shifts depth and pose; a flat replay at fixed distance does not.
//! - **Quality variation**: standard deviation of detector confidence. It
//!   must stay *low*: erratic quality swings point at screen artifacts or a
//!   synthetic source.
//!
//! The clip is live when at least three of the four pass. This is a majority
//! vote, not a learned classifier, and no single check decides alone.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, static screens, spliced identities.
//! - **Does not block:** high-quality 3D masks or deep-fake video that keeps
//!   identity, motion and quality plausible.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::LivenessThresholds;
use crate::error::VerifyError;
use crate::types::{valid_observations, FaceObservation, FrameRecord};

/// Default minimum consecutive-frame embedding similarity.
pub const DEFAULT_MIN_CONSISTENCY: f32 = 0.6;

/// Default minimum peak centroid displacement in working-resolution pixels.
pub const DEFAULT_MIN_MOTION_PX: f32 = 10.0;

/// Default minimum coefficient of variation of face box area.
pub const DEFAULT_MIN_SIZE_VARIATION: f32 = 0.05;

/// Default maximum standard deviation of detector confidence.
pub const DEFAULT_MAX_QUALITY_STD: f32 = 0.15;

/// Minimum frames with a face before any check is meaningful.
pub const DEFAULT_MIN_VALID_FRAMES: usize = 5;

/// Checks that must pass, out of four.
pub const DEFAULT_REQUIRED_CHECKS: usize = 3;

/// The four liveness signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessCheck {
    FaceConsistency,
    Motion,
    SizeVariation,
    QualityVariation,
}

impl LivenessCheck {
    pub const ALL: [LivenessCheck; 4] = [
        LivenessCheck::FaceConsistency,
        LivenessCheck::Motion,
        LivenessCheck::SizeVariation,
        LivenessCheck::QualityVariation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessCheck::FaceConsistency => "face_consistency",
            LivenessCheck::Motion => "motion",
            LivenessCheck::SizeVariation => "size_variation",
            LivenessCheck::QualityVariation => "quality_variation",
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CheckResult {
    pub passed: bool,
    /// The measured value the threshold was applied to.
    pub raw_metric: f32,
    pub threshold: f32,
}

/// Liveness decision for one clip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    /// Fraction of checks passed.
    pub confidence_score: f32,
    pub checks: BTreeMap<LivenessCheck, CheckResult>,
    /// Frames with a detected face.
    pub valid_frame_count: usize,
    /// All frames considered, with or without a face.
    pub total_frames: usize,
    /// Mean detector confidence across valid frames.
    pub mean_confidence: f32,
}

impl LivenessVerdict {
    pub fn passed_checks(&self) -> usize {
        self.checks.values().filter(|c| c.passed).count()
    }

    pub fn check(&self, check: LivenessCheck) -> Option<&CheckResult> {
        self.checks.get(&check)
    }
}

/// Decide whether the clip described by `records` is live.
///
/// Fails with [`VerifyError::InsufficientValidFrames`] when fewer than
/// `thresholds.min_valid_frames` records carry a face.
pub fn evaluate_liveness(
    records: &[FrameRecord],
    thresholds: &LivenessThresholds,
) -> Result<LivenessVerdict, VerifyError> {
    let faces = valid_observations(records);
    let required = thresholds.min_valid_frames.max(2);
    if faces.len() < required {
        return Err(VerifyError::InsufficientValidFrames {
            valid: faces.len(),
            required,
        });
    }

    let consistency = min_consecutive_similarity(&faces)?;
    let motion = max_centroid_displacement(&faces);
    let size_variation = area_coefficient_of_variation(&faces);
    let confidences: Vec<f32> = faces.iter().map(|f| f.confidence).collect();
    let (mean_confidence, quality_std) = mean_and_std(&confidences);

    let mut checks = BTreeMap::new();
    checks.insert(
        LivenessCheck::FaceConsistency,
        CheckResult {
            passed: consistency > thresholds.min_consistency,
            raw_metric: consistency,
            threshold: thresholds.min_consistency,
        },
    );
    checks.insert(
        LivenessCheck::Motion,
        CheckResult {
            passed: motion > thresholds.min_motion_px,
            raw_metric: motion,
            threshold: thresholds.min_motion_px,
        },
    );
    checks.insert(
        LivenessCheck::SizeVariation,
        CheckResult {
            passed: size_variation > thresholds.min_size_variation,
            raw_metric: size_variation,
            threshold: thresholds.min_size_variation,
        },
    );
    checks.insert(
        LivenessCheck::QualityVariation,
        CheckResult {
            passed: quality_std < thresholds.max_quality_std,
            raw_metric: quality_std,
            threshold: thresholds.max_quality_std,
        },
    );

    for (check, result) in &checks {
        tracing::debug!(
            check = check.as_str(),
            passed = result.passed,
            metric = result.raw_metric,
            threshold = result.threshold,
            "liveness check"
        );
    }

    let passed = checks.values().filter(|c| c.passed).count();
    let verdict = LivenessVerdict {
        is_live: passed >= thresholds.required_checks,
        confidence_score: passed as f32 / LivenessCheck::ALL.len() as f32,
        checks,
        valid_frame_count: faces.len(),
        total_frames: records.len(),
        mean_confidence,
    };

    tracing::info!(
        is_live = verdict.is_live,
        passed,
        valid_frames = verdict.valid_frame_count,
        total_frames = verdict.total_frames,
        "liveness evaluated"
    );
    Ok(verdict)
}

fn min_consecutive_similarity(faces: &[&FaceObservation]) -> Result<f32, VerifyError> {
    let mut min_similarity = f32::INFINITY;
    for pair in faces.windows(2) {
        let (prev, curr) = (&pair[0].embedding, &pair[1].embedding);
        if prev.dim() != curr.dim() {
            return Err(VerifyError::DimensionMismatch {
                left: prev.dim(),
                right: curr.dim(),
            });
        }
        min_similarity = min_similarity.min(prev.dot(curr));
    }
    Ok(min_similarity)
}

fn max_centroid_displacement(faces: &[&FaceObservation]) -> f32 {
    faces
        .windows(2)
        .map(|pair| {
            let (px, py) = pair[0].bbox.centroid();
            let (cx, cy) = pair[1].bbox.centroid();
            ((cx - px).powi(2) + (cy - py).powi(2)).sqrt()
        })
        .fold(0.0, f32::max)
}

fn area_coefficient_of_variation(faces: &[&FaceObservation]) -> f32 {
    let areas: Vec<f32> = faces.iter().map(|f| f.bbox.area()).collect();
    let (mean, std) = mean_and_std(&areas);
    if mean > 0.0 {
        std / mean
    } else {
        0.0
    }
}

/// Mean and population standard deviation.
fn mean_and_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, variance.sqrt())
}
