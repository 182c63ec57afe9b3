use serde::Serialize;

use crate::error::VerifyError;
use crate::types::Embedding;

/// Default cosine similarity at or above which two identities match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

/// Result of comparing two identity vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
    pub is_match: bool,
    pub threshold_used: f32,
}

/// Compares two identity vectors against a caller-supplied threshold.
pub trait Matcher {
    fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult, VerifyError>;
}

/// Cosine similarity of unit-norm embeddings, computed as a dot product.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult, VerifyError> {
        if a.dim() != b.dim() {
            return Err(VerifyError::DimensionMismatch {
                left: a.dim(),
                right: b.dim(),
            });
        }

        let similarity = a.dot(b).clamp(-1.0, 1.0);
        let result = MatchResult {
            similarity,
            is_match: similarity >= threshold,
            threshold_used: threshold,
        };
        tracing::debug!(
            similarity,
            threshold,
            is_match = result.is_match,
            "embeddings compared"
        );
        Ok(result)
    }
}

/// Compare two unit-norm embeddings with [`CosineMatcher`].
pub fn compare_embeddings(
    a: &Embedding,
    b: &Embedding,
    threshold: f32,
) -> Result<MatchResult, VerifyError> {
    CosineMatcher.compare(a, b, threshold)
}
