//! Frame sampling policy and extraction.

use std::collections::HashSet;

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;

use crate::config::SamplingPolicy;
use crate::error::VerifyError;
use crate::source::FrameSource;
use crate::types::Resolution;

/// Which timestamps to pull from a clip, and the size to scale them to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePlan {
    pub duration_secs: f64,
    pub timestamps: Vec<f64>,
    pub resolution: Resolution,
}

/// A sampled frame at working resolution.
#[derive(Debug)]
pub struct Frame {
    /// Ordinal position in the sampled sequence.
    pub index: usize,
    pub timestamp_secs: f64,
    pub image: RgbImage,
}

/// Pick evenly spaced timestamps across `[0, duration_secs)`.
///
/// The plan depends only on the duration, the cap and the policy, so the
/// same input always yields the same frames.
pub fn sample_frames(
    policy: &SamplingPolicy,
    duration_secs: f64,
    max_frames: Option<usize>,
) -> Result<SamplePlan, VerifyError> {
    if !duration_secs.is_finite() || duration_secs < policy.min_clip_secs {
        return Err(VerifyError::InsufficientFrames {
            available: 0,
            required: policy.min_frames,
            duration_secs,
        });
    }

    // The caller's cap only trims the long-clip budget.
    let count = if duration_secs < policy.short_clip_secs {
        policy.short_clip_frames
    } else if duration_secs < policy.medium_clip_secs {
        policy.medium_clip_frames
    } else {
        max_frames.map_or(policy.default_max_frames, |cap| {
            cap.min(policy.default_max_frames)
        })
    };

    if count < policy.min_frames {
        return Err(VerifyError::InsufficientFrames {
            available: count,
            required: policy.min_frames,
            duration_secs,
        });
    }

    let step = duration_secs / count as f64;
    let timestamps = (0..count).map(|i| i as f64 * step).collect();

    tracing::debug!(duration_secs, count, "sampling plan");
    Ok(SamplePlan {
        duration_secs,
        timestamps,
        resolution: policy.working_resolution,
    })
}

/// Pull the planned frames from `source`, downscaled to the plan's
/// resolution. Frames that fail to decode are skipped, and each stored
/// source frame is taken at most once.
pub fn extract_frames(
    source: &mut dyn FrameSource,
    plan: &SamplePlan,
    min_frames: usize,
) -> Result<Vec<Frame>, VerifyError> {
    let mut frames = Vec::with_capacity(plan.timestamps.len());
    let mut taken = HashSet::new();
    for (index, &timestamp_secs) in plan.timestamps.iter().enumerate() {
        if let Some(source_index) = source.source_frame(timestamp_secs) {
            if !taken.insert(source_index) {
                tracing::trace!(index, source_index, "source frame already sampled");
                continue;
            }
        }
        let Some(image) = source.frame_at(timestamp_secs) else {
            tracing::debug!(index, timestamp_secs, "frame not extractable");
            continue;
        };
        frames.push(Frame {
            index,
            timestamp_secs,
            image: to_working_resolution(image, plan.resolution),
        });
    }

    if frames.len() < min_frames {
        return Err(VerifyError::InsufficientFrames {
            available: frames.len(),
            required: min_frames,
            duration_secs: plan.duration_secs,
        });
    }

    tracing::debug!(
        planned = plan.timestamps.len(),
        extracted = frames.len(),
        resolution = %plan.resolution,
        "frames extracted"
    );
    Ok(frames)
}

fn to_working_resolution(image: RgbImage, resolution: Resolution) -> RgbImage {
    if image.dimensions() == (resolution.width, resolution.height) {
        return image;
    }
    imageops::resize(
        &image,
        resolution.width,
        resolution.height,
        FilterType::Triangle,
    )
}
