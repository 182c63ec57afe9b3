//! Access to decoded media.
//!
//! Turning a video byte stream into raster frames happens outside this
//! crate; the pipeline only needs a clip's duration and the frame shown at a
//! given timestamp.

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

/// A decoded clip the sampler can pull frames from.
pub trait FrameSource {
    /// Total clip duration in seconds.
    fn duration_secs(&self) -> f64;

    /// The frame shown at `timestamp_secs`, or `None` if it cannot be
    /// decoded.
    fn frame_at(&mut self, timestamp_secs: f64) -> Option<RgbImage>;

    /// Position of the stored frame shown at `timestamp_secs`, for sources
    /// with a finite frame count. Timestamps that resolve to the same stored
    /// frame are sampled once. `None` treats every timestamp as distinct.
    fn source_frame(&self, _timestamp_secs: f64) -> Option<usize> {
        None
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read frame directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid frame rate {0}")]
    InvalidFrameRate(f64),
}

const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// A clip stored as numbered still frames at a fixed frame rate, as written
/// by `ffmpeg -i clip.mp4 frame_%05d.png`.
#[derive(Debug)]
pub struct ImageSequence {
    frames: Vec<PathBuf>,
    frame_rate: f64,
}

impl ImageSequence {
    /// Collect every image file in `dir`, ordered by file name.
    pub fn open(dir: &Path, frame_rate: f64) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SourceError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut frames = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_frame = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_frame {
                frames.push(path);
            }
        }
        frames.sort();

        tracing::debug!(dir = %dir.display(), frames = frames.len(), frame_rate, "opened image sequence");
        Self::from_paths(frames, frame_rate)
    }

    pub fn from_paths(frames: Vec<PathBuf>, frame_rate: f64) -> Result<Self, SourceError> {
        if !frame_rate.is_finite() || frame_rate <= 0.0 {
            return Err(SourceError::InvalidFrameRate(frame_rate));
        }
        Ok(Self { frames, frame_rate })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn duration_secs(&self) -> f64 {
        self.frames.len() as f64 / self.frame_rate
    }

    fn source_frame(&self, timestamp_secs: f64) -> Option<usize> {
        let last = self.frames.len().checked_sub(1)?;
        Some(((timestamp_secs.max(0.0) * self.frame_rate).floor() as usize).min(last))
    }

    fn frame_at(&mut self, timestamp_secs: f64) -> Option<RgbImage> {
        let index = self.source_frame(timestamp_secs)?;
        let path = &self.frames[index];
        match image::open(path) {
            Ok(img) => Some(img.to_rgb8()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable frame");
                None
            }
        }
    }
}
