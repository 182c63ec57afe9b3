//! Offline re-scoring of recorded detector output.

use std::path::Path;

use anyhow::{Context, Result};
use livecheck_core::{
    aggregate_embedding, compare_embeddings, evaluate_liveness, extract_frames, sample_frames,
    AggregatedIdentity, Comparison, Embedding, FaceObservation, FaceObservationCache, FrameRecord,
    FrameSource, ImageSequence, LivenessVerdict, PipelineConfig, SamplePlan, SkipReason,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::{CompareArgs, PlanArgs};

/// Malformed or unusable command input.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InputError(pub String);

/// A recording on disk: a whole clip or one still.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Recording {
    Clip(Vec<FrameRecord>),
    Still(FaceObservation),
}

pub fn load_recording(path: &Path) -> Result<Recording> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let recording: Recording = serde_json::from_str(&contents).with_context(|| {
        format!(
            "{} is neither a frame record list nor a face observation",
            path.display()
        )
    })?;
    if let Recording::Clip(records) = &recording {
        tracing::debug!(path = %path.display(), frames = records.len(), "loaded clip");
    }
    Ok(recording)
}

/// Order a recorded clip by frame index and check every observation.
fn into_cache(records: Vec<FrameRecord>, path: &Path) -> Result<FaceObservationCache> {
    FaceObservationCache::from_records(records)
        .with_context(|| format!("{} is not a usable recording", path.display()))
}

fn load_clip(path: &Path) -> Result<FaceObservationCache> {
    match load_recording(path)? {
        Recording::Clip(records) => into_cache(records, path),
        Recording::Still(_) => Err(InputError(format!(
            "{} holds a single observation, expected a frame record list",
            path.display()
        ))
        .into()),
    }
}

pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => {
            let mut config = PipelineConfig::from_toml_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => PipelineConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Serialize)]
pub struct PlanReport {
    #[serde(flatten)]
    pub plan: SamplePlan,
    /// Frames that actually decoded, when planning against stills.
    pub extracted: Option<usize>,
}

pub fn run_plan(args: &PlanArgs, config: &PipelineConfig) -> Result<PlanReport> {
    if let Some(dir) = &args.frames {
        let fps = args
            .fps
            .ok_or_else(|| InputError("--frames requires --fps".into()))?;
        let mut sequence = ImageSequence::open(dir, fps)
            .with_context(|| format!("failed to open frame directory {}", dir.display()))?;
        let plan = sample_frames(&config.sampling, sequence.duration_secs(), args.max_frames)?;
        let frames = extract_frames(&mut sequence, &plan, config.sampling.min_frames)?;
        return Ok(PlanReport {
            plan,
            extracted: Some(frames.len()),
        });
    }

    let duration = args
        .duration
        .ok_or_else(|| InputError("a clip duration or --frames is required".into()))?;
    Ok(PlanReport {
        plan: sample_frames(&config.sampling, duration, args.max_frames)?,
        extracted: None,
    })
}

pub fn run_liveness(path: &Path, config: &PipelineConfig) -> Result<LivenessVerdict> {
    let cache = load_clip(path)?;
    Ok(evaluate_liveness(cache.records(), &config.liveness)?)
}

pub fn run_aggregate(path: &Path, config: &PipelineConfig) -> Result<AggregatedIdentity> {
    let cache = load_clip(path)?;
    Ok(aggregate_embedding(cache.records(), &config.aggregation)?)
}

#[derive(Debug, Serialize)]
pub struct CompareReport {
    pub probe_liveness: Option<LivenessVerdict>,
    pub reference_liveness: Option<LivenessVerdict>,
    pub comparison: Comparison,
}

impl CompareReport {
    pub fn is_match(&self) -> bool {
        matches!(&self.comparison, Comparison::Evaluated(result) if result.is_match)
    }
}

/// Identity of one side of a comparison. Clips are evaluated for liveness
/// and only aggregated when live.
struct Side {
    liveness: Option<LivenessVerdict>,
    identity: Option<Embedding>,
}

fn resolve_side(path: &Path, config: &PipelineConfig) -> Result<Side> {
    match load_recording(path)? {
        Recording::Still(face) => {
            face.validate(0)
                .with_context(|| format!("{} is not a usable observation", path.display()))?;
            Ok(Side {
                liveness: None,
                identity: Some(face.embedding),
            })
        }
        Recording::Clip(records) => {
            let cache = into_cache(records, path)?;
            let verdict = evaluate_liveness(cache.records(), &config.liveness)?;
            let identity = if verdict.is_live {
                Some(aggregate_embedding(cache.records(), &config.aggregation)?.vector)
            } else {
                None
            };
            Ok(Side {
                liveness: Some(verdict),
                identity,
            })
        }
    }
}

pub fn run_compare(args: &CompareArgs, config: &PipelineConfig) -> Result<CompareReport> {
    let probe = resolve_side(&args.probe, config)?;
    let reference = resolve_side(&args.reference, config)?;
    let threshold = args.threshold.unwrap_or(config.match_threshold);

    let comparison = match (&probe.identity, &reference.identity) {
        (Some(a), Some(b)) => Comparison::Evaluated(compare_embeddings(a, b, threshold)?),
        (None, Some(_)) => Comparison::Skipped {
            reason: SkipReason::ProbeNotLive,
        },
        (Some(_), None) => Comparison::Skipped {
            reason: SkipReason::ReferenceNotLive,
        },
        (None, None) => Comparison::Skipped {
            reason: SkipReason::BothNotLive,
        },
    };

    Ok(CompareReport {
        probe_liveness: probe.liveness,
        reference_liveness: reference.liveness,
        comparison,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecheck_core::{BoundingBox, VerifyError};
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn observation(n: usize, angle: f32, moving: bool) -> FaceObservation {
        let step = if moving { n as f32 } else { 0.0 };
        let size = 120.0 + 8.0 * step;
        FaceObservation {
            bbox: BoundingBox {
                x1: 100.0 + 12.0 * step,
                y1: 90.0,
                x2: 100.0 + 12.0 * step + size,
                y2: 90.0 + size,
            },
            landmarks: None,
            confidence: 0.92,
            embedding: Embedding::new(vec![angle.cos(), angle.sin(), 0.0]),
        }
    }

    fn clip(frames: usize, angle: f32, moving: bool) -> Vec<FrameRecord> {
        (0..frames)
            .map(|index| FrameRecord {
                index,
                observation: Some(observation(index, angle, moving)),
            })
            .collect()
    }

    fn write_json<T: Serialize>(dir: &TempDir, name: &str, value: &T) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(serde_json::to_string(value).unwrap().as_bytes())
            .unwrap();
        path
    }

    fn compare_args(probe: PathBuf, reference: PathBuf) -> CompareArgs {
        CompareArgs {
            probe,
            reference,
            threshold: None,
        }
    }

    #[test]
    fn liveness_of_recorded_clip() {
        let dir = TempDir::new().unwrap();
        let path = write_json(&dir, "clip.json", &clip(8, 0.0, true));
        let verdict = run_liveness(&path, &PipelineConfig::default()).unwrap();
        assert!(verdict.is_live);
        assert_eq!(verdict.valid_frame_count, 8);
    }

    #[test]
    fn liveness_rejects_single_observation() {
        let dir = TempDir::new().unwrap();
        let path = write_json(&dir, "still.json", &observation(0, 0.0, false));
        let err = run_liveness(&path, &PipelineConfig::default()).unwrap_err();
        assert!(err.downcast_ref::<InputError>().is_some());
    }

    #[test]
    fn missing_file_has_context() {
        let err = run_aggregate(Path::new("/nonexistent/clip.json"), &PipelineConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("failed to read"));
        assert!(err.chain().any(|cause| cause.is::<std::io::Error>()));
    }

    #[test]
    fn aggregate_needs_three_faces() {
        let dir = TempDir::new().unwrap();
        let path = write_json(&dir, "short.json", &clip(2, 0.0, true));
        let err = run_aggregate(&path, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::InsufficientFramesForAggregation { valid: 2, .. })
        ));
    }

    #[test]
    fn live_clip_against_still() {
        let dir = TempDir::new().unwrap();
        let probe = write_json(&dir, "clip.json", &clip(10, 0.0, true));
        let reference = write_json(&dir, "still.json", &observation(0, 0.3, false));

        let report = run_compare(
            &compare_args(probe, reference),
            &PipelineConfig::default(),
        )
        .unwrap();
        assert!(report.is_match());
        assert!(report.probe_liveness.unwrap().is_live);
        assert!(report.reference_liveness.is_none());
    }

    #[test]
    fn static_clip_is_not_compared() {
        let dir = TempDir::new().unwrap();
        let probe = write_json(&dir, "photo.json", &clip(10, 0.0, false));
        let reference = write_json(&dir, "still.json", &observation(0, 0.0, false));

        let report = run_compare(
            &compare_args(probe, reference),
            &PipelineConfig::default(),
        )
        .unwrap();
        assert!(!report.is_match());
        assert_eq!(
            report.comparison,
            Comparison::Skipped {
                reason: SkipReason::ProbeNotLive
            }
        );
    }

    #[test]
    fn shuffled_clip_is_evaluated_in_index_order() {
        let dir = TempDir::new().unwrap();
        let ordered = clip(10, 0.0, true);
        let mut shuffled = ordered.clone();
        shuffled.swap(0, 9);
        shuffled.swap(2, 6);
        shuffled.reverse();

        let config = PipelineConfig::default();
        let expected = run_liveness(&write_json(&dir, "ordered.json", &ordered), &config).unwrap();
        let actual = run_liveness(&write_json(&dir, "shuffled.json", &shuffled), &config).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn duplicate_index_is_an_input_error() {
        let dir = TempDir::new().unwrap();
        let mut records = clip(8, 0.0, true);
        records[5].index = 2;
        let path = write_json(&dir, "dup.json", &records);

        let err = run_liveness(&path, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::InvalidRecord { index: 2, .. })
        ));
    }

    #[test]
    fn non_unit_still_is_rejected() {
        let dir = TempDir::new().unwrap();
        let probe = write_json(&dir, "clip.json", &clip(10, 0.0, true));
        let mut still = observation(0, 0.0, false);
        still.embedding = Embedding::new(vec![2.0, 0.0, 0.0]);
        let reference = write_json(&dir, "still.json", &still);

        let err = run_compare(&compare_args(probe, reference), &PipelineConfig::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn plan_from_duration() {
        let args = PlanArgs {
            duration: Some(3.0),
            frames: None,
            fps: None,
            max_frames: None,
        };
        let report = run_plan(&args, &PipelineConfig::default()).unwrap();
        assert_eq!(report.plan.timestamps.len(), 15);
        assert!(report.extracted.is_none());
    }

    #[test]
    fn plan_against_extracted_stills() {
        let dir = TempDir::new().unwrap();
        for i in 0..30 {
            image::RgbImage::new(4, 4)
                .save(dir.path().join(format!("frame_{i:05}.png")))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

        let args = PlanArgs {
            duration: None,
            frames: Some(dir.path().to_path_buf()),
            fps: Some(10.0),
            max_frames: None,
        };
        let report = run_plan(&args, &PipelineConfig::default()).unwrap();
        assert_eq!(report.plan.duration_secs, 3.0);
        assert_eq!(report.plan.timestamps.len(), 15);
        assert_eq!(report.extracted, Some(15));
    }

    #[test]
    fn config_file_is_validated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("livecheck.toml");
        std::fs::write(&path, "match_threshold = 3.0\n").unwrap();
        assert!(load_config(Some(&path)).is_err());

        std::fs::write(&path, "match_threshold = 0.55\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!((config.match_threshold - 0.55).abs() < 1e-6);
    }
}
