//! Cross-frame identity aggregation.
//!
//! The per-frame embeddings of a clip are averaged componentwise and the
//! mean is renormalized to unit length, so a single badly posed frame cannot
//! dominate the clip's identity.

use serde::Serialize;

use crate::config::AggregationPolicy;
use crate::error::VerifyError;
use crate::types::{valid_observations, Embedding, FrameRecord};

/// One identity vector for a whole clip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedIdentity {
    /// Unit-norm mean embedding.
    pub vector: Embedding,
    pub source_frame_count: usize,
}

/// Reduce the embeddings of every frame with a face to one unit vector.
pub fn aggregate_embedding(
    records: &[FrameRecord],
    policy: &AggregationPolicy,
) -> Result<AggregatedIdentity, VerifyError> {
    let faces = valid_observations(records);
    let required = policy.min_valid_frames.max(1);
    if faces.len() < required {
        return Err(VerifyError::InsufficientFramesForAggregation {
            valid: faces.len(),
            required,
        });
    }

    let dim = faces[0].embedding.dim();
    let mut sum = vec![0.0f64; dim];
    for face in &faces {
        if face.embedding.dim() != dim {
            return Err(VerifyError::DimensionMismatch {
                left: dim,
                right: face.embedding.dim(),
            });
        }
        for (acc, v) in sum.iter_mut().zip(face.embedding.values.iter()) {
            *acc += f64::from(*v);
        }
    }

    let n = faces.len() as f64;
    let mean = Embedding::new(sum.into_iter().map(|s| (s / n) as f32).collect());
    let vector = mean
        .normalized()
        .ok_or(VerifyError::DegenerateAggregate { frames: faces.len() })?;

    tracing::info!(frames = faces.len(), dim, "aggregated clip embedding");
    Ok(AggregatedIdentity {
        vector,
        source_frame_count: faces.len(),
    })
}
