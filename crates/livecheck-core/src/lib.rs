//! livecheck-core: liveness decision engine and cross-frame identity aggregation.
//!
//! Decides from noisy per-frame face observations whether a sampled clip
//! depicts a live subject, and whether two biometric samples belong to the
//! same person. Face detection itself is an injected capability
//! ([`FaceDetector`]); media decoding is reached through [`FrameSource`].
//!
//! Data flows one way:
//! sampler → frames → [`FaceObservationCache`] → liveness / aggregation →
//! matcher → [`Verifier`].

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod sampler;
pub mod source;
pub mod types;

pub use aggregate::{aggregate_embedding, AggregatedIdentity};
pub use cache::FaceObservationCache;
pub use config::{
    AggregationPolicy, ConfigError, LivenessThresholds, PipelineConfig, SamplingPolicy,
};
pub use detector::{spawn_detection_worker, DetectorHandle, ExclusiveDetector, FaceDetector};
pub use error::{DetectorError, Operand, VerifyError};
pub use liveness::{evaluate_liveness, CheckResult, LivenessCheck, LivenessVerdict};
pub use matcher::{compare_embeddings, CosineMatcher, MatchResult, Matcher};
pub use orchestrator::{
    Comparison, FaceDetection, SkipReason, Stage, VerificationMode, VerificationOutcome,
    VerificationRequest, Verifier, VerifyOptions,
};
pub use sampler::{extract_frames, sample_frames, Frame, SamplePlan};
pub use source::{FrameSource, ImageSequence, SourceError};
pub use types::{BoundingBox, Embedding, FaceObservation, FrameRecord, Landmarks, Resolution};
