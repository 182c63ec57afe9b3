//! Verification modes composed from the pipeline stages.
//!
//! Every request runs through `Sampling → Detecting → Checking →
//! (Aggregating) → Comparing → Done`, failing out of any stage. Identity is
//! never compared for a clip that failed liveness: the liveness verdict is
//! still returned, but the comparison is skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;

use crate::aggregate::{aggregate_embedding, AggregatedIdentity};
use crate::cache::{observe, select_subject, FaceObservationCache};
use crate::config::PipelineConfig;
use crate::detector::FaceDetector;
use crate::error::{Operand, VerifyError};
use crate::liveness::{evaluate_liveness, LivenessVerdict};
use crate::matcher::{CosineMatcher, MatchResult, Matcher};
use crate::sampler::{extract_frames, sample_frames};
use crate::source::FrameSource;
use crate::types::{BoundingBox, FaceObservation};

/// Pipeline stage of a verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sampling,
    Detecting,
    Checking,
    Aggregating,
    Comparing,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Sampling => "sampling",
            Stage::Detecting => "detecting",
            Stage::Checking => "checking",
            Stage::Aggregating => "aggregating",
            Stage::Comparing => "comparing",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    ImagePair,
    VideoLiveness,
    VideoVsImage,
    VideoVsVideo,
}

impl VerificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMode::ImagePair => "image_pair",
            VerificationMode::VideoLiveness => "video_liveness",
            VerificationMode::VideoVsImage => "video_vs_image",
            VerificationMode::VideoVsVideo => "video_vs_video",
        }
    }
}

/// Inputs of one verification call.
pub enum VerificationRequest<'a> {
    ImagePair {
        probe: &'a RgbImage,
        reference: &'a RgbImage,
    },
    VideoLiveness {
        clip: &'a mut dyn FrameSource,
    },
    VideoVsImage {
        clip: &'a mut dyn FrameSource,
        reference: &'a RgbImage,
    },
    VideoVsVideo {
        probe: &'a mut dyn FrameSource,
        reference: &'a mut dyn FrameSource,
    },
}

impl VerificationRequest<'_> {
    pub fn mode(&self) -> VerificationMode {
        match self {
            VerificationRequest::ImagePair { .. } => VerificationMode::ImagePair,
            VerificationRequest::VideoLiveness { .. } => VerificationMode::VideoLiveness,
            VerificationRequest::VideoVsImage { .. } => VerificationMode::VideoVsImage,
            VerificationRequest::VideoVsVideo { .. } => VerificationMode::VideoVsVideo,
        }
    }
}

/// Per-call overrides. Unset fields fall back to the pipeline config.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub match_threshold: Option<f32>,
    pub max_frames: Option<usize>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ProbeNotLive,
    ReferenceNotLive,
    BothNotLive,
}

/// Whether and how identity was compared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Comparison {
    /// The mode has no identity step.
    NotRequested,
    /// Liveness failed, so identity was never evaluated.
    Skipped { reason: SkipReason },
    Evaluated(MatchResult),
}

/// Result of one verification call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub request_id: String,
    pub mode: VerificationMode,
    pub probe_liveness: Option<LivenessVerdict>,
    pub reference_liveness: Option<LivenessVerdict>,
    pub comparison: Comparison,
    pub message: String,
    pub elapsed_ms: u64,
}

impl VerificationOutcome {
    /// True only when a similarity was actually computed and cleared the
    /// threshold.
    pub fn is_match(&self) -> bool {
        matches!(&self.comparison, Comparison::Evaluated(result) if result.is_match)
    }

    pub fn similarity(&self) -> Option<f32> {
        match &self.comparison {
            Comparison::Evaluated(result) => Some(result.similarity),
            _ => None,
        }
    }

    /// Every clip is live and, if the mode compares identity, it matched.
    pub fn accepted(&self) -> bool {
        let live = [&self.probe_liveness, &self.reference_liveness]
            .into_iter()
            .flatten()
            .all(|v| v.is_live);
        match self.mode {
            VerificationMode::VideoLiveness => live,
            _ => live && self.is_match(),
        }
    }
}

/// Single-image detection report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceDetection {
    pub face_detected: bool,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
    pub message: String,
}

/// Stage tracking and deadline enforcement for one request. The deadline is
/// only checked between stages; an in-flight detection is never cancelled.
struct Run {
    started: Instant,
    deadline: Option<Instant>,
    stage: Stage,
}

impl Run {
    fn start(first: Stage, timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        tracing::debug!(stage = %first, "stage");
        Self {
            started,
            // A deadline past the end of representable time is no deadline.
            deadline: timeout.and_then(|t| started.checked_add(t)),
            stage: first,
        }
    }

    fn enter(&mut self, next: Stage) -> Result<(), VerifyError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                tracing::warn!(stage = %self.stage, elapsed_ms = self.elapsed_ms(), "deadline exceeded");
                return Err(VerifyError::Timeout {
                    stage: self.stage,
                    elapsed_ms: self.elapsed_ms(),
                });
            }
        }
        tracing::debug!(from = %self.stage, to = %next, "stage");
        self.stage = next;
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Composes sampling, detection, liveness, aggregation and comparison into
/// the verification modes.
///
/// Holds a shared reference to the detection capability; each call builds
/// and discards its own observation cache.
pub struct Verifier {
    detector: Arc<dyn FaceDetector>,
    config: PipelineConfig,
    matcher: CosineMatcher,
}

impl Verifier {
    pub fn new(detector: Arc<dyn FaceDetector>, config: PipelineConfig) -> Self {
        Self {
            detector,
            config,
            matcher: CosineMatcher,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_ready()
    }

    fn ensure_ready(&self) -> Result<(), VerifyError> {
        if self.detector.is_ready() {
            Ok(())
        } else {
            Err(VerifyError::DetectionUnavailable(
                "detector is not ready".to_string(),
            ))
        }
    }

    /// Detect the most confident face in a single image. Faces below
    /// `min_confidence` are reported as not detected.
    pub fn detect_face(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<FaceDetection, VerifyError> {
        self.ensure_ready()?;
        let faces = self.detector.detect(image)?;
        let report = match select_subject(faces, 0)? {
            None => FaceDetection {
                face_detected: false,
                confidence: 0.0,
                bbox: None,
                message: "No face detected".to_string(),
            },
            Some(face) if face.confidence < min_confidence => FaceDetection {
                face_detected: false,
                confidence: face.confidence,
                bbox: None,
                message: format!("Face confidence below threshold {min_confidence}"),
            },
            Some(face) => FaceDetection {
                face_detected: true,
                confidence: face.confidence,
                bbox: Some(face.bbox),
                message: "Face detected successfully".to_string(),
            },
        };
        tracing::info!(
            face_detected = report.face_detected,
            confidence = report.confidence,
            "single image detection"
        );
        Ok(report)
    }

    /// Run one verification request.
    pub fn verify(
        &self,
        request: VerificationRequest<'_>,
        options: VerifyOptions,
    ) -> Result<VerificationOutcome, VerifyError> {
        let mode = request.mode();
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("verify", request_id = %request_id, mode = mode.as_str());
        let _guard = span.enter();

        self.ensure_ready()?;
        let threshold = options.match_threshold.unwrap_or(self.config.match_threshold);
        let timeout = options.timeout.or_else(|| self.config.verify_timeout());

        let result = match request {
            VerificationRequest::ImagePair { probe, reference } => {
                self.image_pair(probe, reference, threshold, timeout)
            }
            VerificationRequest::VideoLiveness { clip } => {
                self.video_liveness(clip, options.max_frames, timeout)
            }
            VerificationRequest::VideoVsImage { clip, reference } => {
                self.video_vs_image(clip, reference, options.max_frames, threshold, timeout)
            }
            VerificationRequest::VideoVsVideo { probe, reference } => {
                self.video_vs_video(probe, reference, options.max_frames, threshold, timeout)
            }
        };

        match result {
            Ok(partial) => {
                let outcome = VerificationOutcome {
                    request_id,
                    mode,
                    probe_liveness: partial.probe_liveness,
                    reference_liveness: partial.reference_liveness,
                    comparison: partial.comparison,
                    message: partial.message,
                    elapsed_ms: partial.elapsed_ms,
                };
                tracing::info!(
                    accepted = outcome.accepted(),
                    similarity = ?outcome.similarity(),
                    elapsed_ms = outcome.elapsed_ms,
                    "verification complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = e.kind(), "verification failed");
                Err(e)
            }
        }
    }

    fn image_pair(
        &self,
        probe: &RgbImage,
        reference: &RgbImage,
        threshold: f32,
        timeout: Option<Duration>,
    ) -> Result<Partial, VerifyError> {
        let mut run = Run::start(Stage::Detecting, timeout);
        let probe_face = self.observe_image(probe, Operand::Probe)?;
        let reference_face = self.observe_image(reference, Operand::Reference)?;

        run.enter(Stage::Comparing)?;
        let result = self
            .matcher
            .compare(&probe_face.embedding, &reference_face.embedding, threshold)?;

        run.enter(Stage::Done)?;
        Ok(Partial {
            probe_liveness: None,
            reference_liveness: None,
            message: format!(
                "Faces {} (similarity: {:.3})",
                if result.is_match { "match" } else { "do not match" },
                result.similarity
            ),
            comparison: Comparison::Evaluated(result),
            elapsed_ms: run.elapsed_ms(),
        })
    }

    fn video_liveness(
        &self,
        clip: &mut dyn FrameSource,
        max_frames: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Partial, VerifyError> {
        let mut run = Run::start(Stage::Sampling, timeout);
        let (_, verdict) = self.check_clip(&mut run, clip, max_frames, Operand::Probe)?;

        run.enter(Stage::Done)?;
        Ok(Partial {
            message: format!(
                "Liveness check: {}/4 checks passed",
                verdict.passed_checks()
            ),
            probe_liveness: Some(verdict),
            reference_liveness: None,
            comparison: Comparison::NotRequested,
            elapsed_ms: run.elapsed_ms(),
        })
    }

    fn video_vs_image(
        &self,
        clip: &mut dyn FrameSource,
        reference: &RgbImage,
        max_frames: Option<usize>,
        threshold: f32,
        timeout: Option<Duration>,
    ) -> Result<Partial, VerifyError> {
        let mut run = Run::start(Stage::Sampling, timeout);
        let (cache, verdict) = self.check_clip(&mut run, clip, max_frames, Operand::Probe)?;

        if !verdict.is_live {
            run.enter(Stage::Done)?;
            return Ok(Partial {
                message: format!(
                    "Liveness check failed: {}/4 checks passed",
                    verdict.passed_checks()
                ),
                probe_liveness: Some(verdict),
                reference_liveness: None,
                comparison: Comparison::Skipped {
                    reason: SkipReason::ProbeNotLive,
                },
                elapsed_ms: run.elapsed_ms(),
            });
        }

        run.enter(Stage::Aggregating)?;
        let identity = self.aggregate(&cache, Operand::Probe)?;
        drop(cache);
        let reference_face = self.observe_image(reference, Operand::Reference)?;

        run.enter(Stage::Comparing)?;
        let result =
            self.matcher
                .compare(&identity.vector, &reference_face.embedding, threshold)?;

        run.enter(Stage::Done)?;
        Ok(Partial {
            message: authentication_message(&result),
            probe_liveness: Some(verdict),
            reference_liveness: None,
            comparison: Comparison::Evaluated(result),
            elapsed_ms: run.elapsed_ms(),
        })
    }

    fn video_vs_video(
        &self,
        probe: &mut dyn FrameSource,
        reference: &mut dyn FrameSource,
        max_frames: Option<usize>,
        threshold: f32,
        timeout: Option<Duration>,
    ) -> Result<Partial, VerifyError> {
        let mut run = Run::start(Stage::Sampling, timeout);
        let (probe_cache, probe_verdict) =
            self.check_clip(&mut run, probe, max_frames, Operand::Probe)?;
        run.enter(Stage::Sampling)?;
        let (reference_cache, reference_verdict) =
            self.check_clip(&mut run, reference, max_frames, Operand::Reference)?;

        let skip = match (probe_verdict.is_live, reference_verdict.is_live) {
            (true, true) => None,
            (false, true) => Some(SkipReason::ProbeNotLive),
            (true, false) => Some(SkipReason::ReferenceNotLive),
            (false, false) => Some(SkipReason::BothNotLive),
        };
        if let Some(reason) = skip {
            run.enter(Stage::Done)?;
            return Ok(Partial {
                message: "Liveness check failed on one or both videos".to_string(),
                probe_liveness: Some(probe_verdict),
                reference_liveness: Some(reference_verdict),
                comparison: Comparison::Skipped { reason },
                elapsed_ms: run.elapsed_ms(),
            });
        }

        run.enter(Stage::Aggregating)?;
        let probe_identity = self.aggregate(&probe_cache, Operand::Probe)?;
        let reference_identity = self.aggregate(&reference_cache, Operand::Reference)?;

        run.enter(Stage::Comparing)?;
        let result = self.matcher.compare(
            &probe_identity.vector,
            &reference_identity.vector,
            threshold,
        )?;

        run.enter(Stage::Done)?;
        Ok(Partial {
            message: authentication_message(&result),
            probe_liveness: Some(probe_verdict),
            reference_liveness: Some(reference_verdict),
            comparison: Comparison::Evaluated(result),
            elapsed_ms: run.elapsed_ms(),
        })
    }

    /// Sample, detect and evaluate one clip. The run must be in `Sampling`.
    fn check_clip(
        &self,
        run: &mut Run,
        clip: &mut dyn FrameSource,
        max_frames: Option<usize>,
        operand: Operand,
    ) -> Result<(FaceObservationCache, LivenessVerdict), VerifyError> {
        let sampling = &self.config.sampling;
        let plan = sample_frames(sampling, clip.duration_secs(), max_frames)?;
        let frames = extract_frames(clip, &plan, sampling.min_frames)?;

        run.enter(Stage::Detecting)?;
        let cache =
            FaceObservationCache::populate(self.detector.as_ref(), frames, self.config.detection_workers)?;

        run.enter(Stage::Checking)?;
        let verdict = evaluate_liveness(cache.records(), &self.config.liveness)?;
        tracing::info!(
            operand = %operand,
            is_live = verdict.is_live,
            confidence = verdict.confidence_score,
            "clip liveness"
        );
        Ok((cache, verdict))
    }

    fn aggregate(
        &self,
        cache: &FaceObservationCache,
        operand: Operand,
    ) -> Result<AggregatedIdentity, VerifyError> {
        let identity = aggregate_embedding(cache.records(), &self.config.aggregation)?;
        tracing::debug!(operand = %operand, frames = identity.source_frame_count, "identity aggregated");
        Ok(identity)
    }

    fn observe_image(
        &self,
        image: &RgbImage,
        operand: Operand,
    ) -> Result<FaceObservation, VerifyError> {
        let face = observe(self.detector.as_ref(), image, 0, self.detector.embedding_dim())?
            .ok_or(VerifyError::NoFaceDetected { operand })?;
        tracing::debug!(operand = %operand, confidence = face.confidence, "image face detected");
        Ok(face)
    }
}

/// Mode result before request metadata is attached.
struct Partial {
    probe_liveness: Option<LivenessVerdict>,
    reference_liveness: Option<LivenessVerdict>,
    comparison: Comparison,
    message: String,
    elapsed_ms: u64,
}

fn authentication_message(result: &MatchResult) -> String {
    format!(
        "Authentication {} (similarity: {:.3})",
        if result.is_match { "successful" } else { "failed" },
        result.similarity
    )
}
