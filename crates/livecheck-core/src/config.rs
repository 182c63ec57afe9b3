use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::liveness::{
    DEFAULT_MAX_QUALITY_STD, DEFAULT_MIN_CONSISTENCY, DEFAULT_MIN_MOTION_PX,
    DEFAULT_MIN_SIZE_VARIATION, DEFAULT_MIN_VALID_FRAMES, DEFAULT_REQUIRED_CHECKS,
};
use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::types::Resolution;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// How many frames to sample from a clip and at what size.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    /// Clips shorter than this (seconds) use `short_clip_frames`.
    pub short_clip_secs: f64,
    pub short_clip_frames: usize,
    /// Clips shorter than this (seconds) use `medium_clip_frames`.
    pub medium_clip_secs: f64,
    pub medium_clip_frames: usize,
    /// Frame budget for longer clips.
    pub default_max_frames: usize,
    /// Below this many extractable frames liveness cannot be assessed.
    pub min_frames: usize,
    /// Clips shorter than this (seconds) are rejected outright.
    pub min_clip_secs: f64,
    /// Every sampled frame is downscaled to this size before detection.
    pub working_resolution: Resolution,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            short_clip_secs: 2.0,
            short_clip_frames: 10,
            medium_clip_secs: 5.0,
            medium_clip_frames: 15,
            default_max_frames: 30,
            min_frames: 5,
            min_clip_secs: 0.2,
            working_resolution: Resolution {
                width: 640,
                height: 480,
            },
        }
    }
}

/// Pass thresholds for the four liveness signals.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LivenessThresholds {
    /// Minimum cosine similarity between consecutive embeddings. One
    /// dissimilar transition (a face swap) fails the clip.
    pub min_consistency: f32,
    /// Largest centroid displacement (working-resolution pixels) must exceed
    /// this. A photo held to the camera stays put.
    pub min_motion_px: f32,
    /// Coefficient of variation of box area must exceed this (0.05 = 5%).
    /// Natural head movement changes apparent face size.
    pub min_size_variation: f32,
    /// Standard deviation of detector confidence must stay below this.
    /// Erratic quality points at a screen or synthetic source.
    pub max_quality_std: f32,
    pub min_valid_frames: usize,
    /// Checks that must pass, out of four.
    pub required_checks: usize,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            min_consistency: DEFAULT_MIN_CONSISTENCY,
            min_motion_px: DEFAULT_MIN_MOTION_PX,
            min_size_variation: DEFAULT_MIN_SIZE_VARIATION,
            max_quality_std: DEFAULT_MAX_QUALITY_STD,
            min_valid_frames: DEFAULT_MIN_VALID_FRAMES,
            required_checks: DEFAULT_REQUIRED_CHECKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregationPolicy {
    pub min_valid_frames: usize,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            min_valid_frames: 3,
        }
    }
}

/// Tunables for a verification pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sampling: SamplingPolicy,
    pub liveness: LivenessThresholds,
    pub aggregation: AggregationPolicy,
    /// Cosine similarity at or above which two identities match.
    pub match_threshold: f32,
    /// Parallel detection workers; 0 uses the available cores.
    pub detection_workers: usize,
    /// Wall-clock budget for one verify call, checked between stages.
    pub verify_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingPolicy::default(),
            liveness: LivenessThresholds::default(),
            aggregation: AggregationPolicy::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            detection_workers: 1,
            verify_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults with `LIVECHECK_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `LIVECHECK_*` overrides from `lookup`. Unparseable values keep
    /// the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let f32_var = |key: &str, current: f32| parse_or(lookup(key), current);
        let usize_var = |key: &str, current: usize| parse_or(lookup(key), current);

        self.match_threshold = f32_var("LIVECHECK_MATCH_THRESHOLD", self.match_threshold);
        self.detection_workers = usize_var("LIVECHECK_DETECTION_WORKERS", self.detection_workers);
        self.sampling.default_max_frames =
            usize_var("LIVECHECK_MAX_FRAMES", self.sampling.default_max_frames);
        self.sampling.working_resolution.width = parse_or(
            lookup("LIVECHECK_WORKING_WIDTH"),
            self.sampling.working_resolution.width,
        );
        self.sampling.working_resolution.height = parse_or(
            lookup("LIVECHECK_WORKING_HEIGHT"),
            self.sampling.working_resolution.height,
        );
        self.liveness.min_consistency =
            f32_var("LIVECHECK_MIN_CONSISTENCY", self.liveness.min_consistency);
        self.liveness.min_motion_px = f32_var("LIVECHECK_MIN_MOTION_PX", self.liveness.min_motion_px);
        self.liveness.min_size_variation = f32_var(
            "LIVECHECK_MIN_SIZE_VARIATION",
            self.liveness.min_size_variation,
        );
        self.liveness.max_quality_std =
            f32_var("LIVECHECK_MAX_QUALITY_STD", self.liveness.max_quality_std);

        if let Some(secs) = lookup("LIVECHECK_VERIFY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.verify_timeout_secs = if secs == 0 { None } else { Some(secs) };
        }
    }

    pub fn verify_timeout(&self) -> Option<Duration> {
        self.verify_timeout_secs.map(Duration::from_secs)
    }

    /// Reject settings no pipeline could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let res = self.sampling.working_resolution;
        if res.width == 0 || res.height == 0 {
            return Err(invalid("sampling.working_resolution", format!("{res} is empty")));
        }
        if self.sampling.min_frames == 0 {
            return Err(invalid("sampling.min_frames", "must be at least 1".into()));
        }
        let sampling = &self.sampling;
        if !sampling.min_clip_secs.is_finite() || sampling.min_clip_secs < 0.0 {
            return Err(invalid(
                "sampling.min_clip_secs",
                format!("{} is not a non-negative duration", sampling.min_clip_secs),
            ));
        }
        if !sampling.short_clip_secs.is_finite()
            || !sampling.medium_clip_secs.is_finite()
            || sampling.short_clip_secs >= sampling.medium_clip_secs
        {
            return Err(invalid(
                "sampling.short_clip_secs",
                format!(
                    "{} must be below medium_clip_secs ({})",
                    sampling.short_clip_secs, sampling.medium_clip_secs
                ),
            ));
        }
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err(invalid(
                "match_threshold",
                format!("{} is outside [-1, 1]", self.match_threshold),
            ));
        }
        if !(-1.0..=1.0).contains(&self.liveness.min_consistency) {
            return Err(invalid(
                "liveness.min_consistency",
                format!("{} is outside [-1, 1]", self.liveness.min_consistency),
            ));
        }
        let liveness = &self.liveness;
        for (field, value) in [
            ("liveness.min_motion_px", liveness.min_motion_px),
            ("liveness.min_size_variation", liveness.min_size_variation),
            ("liveness.max_quality_std", liveness.max_quality_std),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("{value} is not a finite non-negative number")));
            }
        }
        if self.liveness.required_checks == 0 || self.liveness.required_checks > 4 {
            return Err(invalid(
                "liveness.required_checks",
                format!("{} is not between 1 and 4", self.liveness.required_checks),
            ));
        }
        if self.aggregation.min_valid_frames == 0 {
            return Err(invalid(
                "aggregation.min_valid_frames",
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: String) -> ConfigError {
    ConfigError::Invalid { field, message }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = PipelineConfig::default();
        assert_eq!(config.match_threshold, 0.4);
        assert_eq!(config.liveness.min_consistency, 0.6);
        assert_eq!(config.liveness.min_motion_px, 10.0);
        assert_eq!(config.liveness.min_size_variation, 0.05);
        assert_eq!(config.liveness.max_quality_std, 0.15);
        assert_eq!(config.sampling.working_resolution.to_string(), "640x480");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_named_keys() {
        let config = PipelineConfig::from_toml_str(
            r#"
            match_threshold = 0.5

            [liveness]
            min_motion_px = 4.0

            [sampling.working_resolution]
            width = 320
            height = 240
            "#,
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.liveness.min_motion_px, 4.0);
        assert_eq!(config.liveness.min_consistency, 0.6);
        assert_eq!(config.sampling.working_resolution.width, 320);
        assert_eq!(config.sampling.default_max_frames, 30);
    }

    #[test]
    fn toml_rejects_out_of_range_threshold() {
        let err = PipelineConfig::from_toml_str("match_threshold = 1.5").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "match_threshold",
                ..
            }
        ));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("LIVECHECK_MATCH_THRESHOLD", "0.55"),
            ("LIVECHECK_MAX_FRAMES", "not-a-number"),
            ("LIVECHECK_VERIFY_TIMEOUT_SECS", "12"),
            ("LIVECHECK_MIN_MOTION_PX", "6.5"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.match_threshold, 0.55);
        assert_eq!(config.sampling.default_max_frames, 30);
        assert_eq!(config.verify_timeout(), Some(Duration::from_secs(12)));
        assert_eq!(config.liveness.min_motion_px, 6.5);
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut config = PipelineConfig {
            verify_timeout_secs: Some(5),
            ..PipelineConfig::default()
        };
        config.apply_overrides(|key| (key == "LIVECHECK_VERIFY_TIMEOUT_SECS").then(|| "0".into()));
        assert_eq!(config.verify_timeout(), None);
    }

    #[test]
    fn validate_rejects_impossible_check_count() {
        let mut config = PipelineConfig::default();
        config.liveness.required_checks = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_clip_bounds() {
        let mut config = PipelineConfig::default();
        config.sampling.min_clip_secs = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "sampling.min_clip_secs",
                ..
            })
        ));

        config.sampling.min_clip_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.sampling.short_clip_secs = 6.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "sampling.short_clip_secs",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_non_finite_liveness_thresholds() {
        let mut config = PipelineConfig::default();
        config.liveness.min_motion_px = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "liveness.min_motion_px",
                ..
            })
        ));

        let mut config = PipelineConfig::default();
        config.liveness.max_quality_std = f32::INFINITY;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.match_threshold = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_nan_threshold_is_rejected() {
        let err = PipelineConfig::from_toml_str("[liveness]\nmin_motion_px = nan\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "liveness.min_motion_px",
                ..
            }
        ));
    }
}
