//! Per-request store of detection outcomes.
//!
//! Detection is the dominant cost of a verification, and both the liveness
//! checks and the identity aggregation need every frame's face. The cache is
//! populated once, eagerly, with exactly one detector call per frame; every
//! downstream consumer reads from it and never calls the detector itself.

use image::RgbImage;
use rayon::prelude::*;

use crate::detector::FaceDetector;
use crate::error::{DetectorError, VerifyError};
use crate::sampler::Frame;
use crate::types::{FaceObservation, FrameRecord};

/// Immutable map from frame index to detection outcome.
#[derive(Debug, Clone)]
pub struct FaceObservationCache {
    records: Vec<FrameRecord>,
}

impl FaceObservationCache {
    /// Run `detector` once per frame and keep the most confident face of
    /// each. The frames are consumed; their pixel buffers are released when
    /// this returns.
    ///
    /// With `workers > 1` (or 0 for one per core) frames are detected in
    /// parallel. The detector must then tolerate concurrent calls.
    pub fn populate(
        detector: &dyn FaceDetector,
        frames: Vec<Frame>,
        workers: usize,
    ) -> Result<Self, VerifyError> {
        let expected_dim = detector.embedding_dim();
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };

        let records = if workers > 1 && frames.len() > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(workers.min(frames.len()))
                .thread_name(|i| format!("livecheck-detect-{i}"))
                .build()
            {
                Ok(pool) => pool.install(|| {
                    frames
                        .par_iter()
                        .map(|frame| detect_frame(detector, frame, expected_dim))
                        .collect::<Result<Vec<_>, _>>()
                })?,
                Err(e) => {
                    tracing::warn!(error = %e, "detection pool unavailable, detecting sequentially");
                    detect_sequential(detector, &frames, expected_dim)?
                }
            }
        } else {
            detect_sequential(detector, &frames, expected_dim)?
        };

        let cache = Self { records };
        tracing::debug!(
            frames = cache.len(),
            with_face = cache.valid_count(),
            workers,
            "observation cache populated"
        );
        Ok(cache)
    }

    /// Wrap detection outcomes recorded elsewhere, ordered by index.
    ///
    /// Each index may appear once, every observation must pass
    /// [`FaceObservation::validate`] and all embeddings must share one
    /// dimension.
    pub fn from_records(mut records: Vec<FrameRecord>) -> Result<Self, VerifyError> {
        records.sort_by_key(|r| r.index);
        if let Some(pair) = records.windows(2).find(|pair| pair[0].index == pair[1].index) {
            return Err(VerifyError::InvalidRecord {
                index: pair[0].index,
                reason: "index recorded more than once".to_string(),
            });
        }

        let mut dim = None;
        for record in &records {
            let Some(face) = &record.observation else {
                continue;
            };
            face.validate(record.index)?;
            match dim {
                None => dim = Some(face.embedding.dim()),
                Some(expected) if expected != face.embedding.dim() => {
                    return Err(VerifyError::DimensionMismatch {
                        left: expected,
                        right: face.embedding.dim(),
                    });
                }
                Some(_) => {}
            }
        }

        Ok(Self { records })
    }

    pub fn get(&self, index: usize) -> Option<&FrameRecord> {
        self.records
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.records[pos])
    }

    /// All records in sampled order.
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Frames in which a face was found.
    pub fn valid_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_present()).count()
    }
}

fn detect_sequential(
    detector: &dyn FaceDetector,
    frames: &[Frame],
    expected_dim: usize,
) -> Result<Vec<FrameRecord>, VerifyError> {
    frames
        .iter()
        .map(|frame| detect_frame(detector, frame, expected_dim))
        .collect()
}

fn detect_frame(
    detector: &dyn FaceDetector,
    frame: &Frame,
    expected_dim: usize,
) -> Result<FrameRecord, VerifyError> {
    Ok(FrameRecord {
        index: frame.index,
        observation: observe(detector, &frame.image, frame.index, expected_dim)?,
    })
}

/// One detector call on `image`, reduced to a validated subject face.
pub(crate) fn observe(
    detector: &dyn FaceDetector,
    image: &RgbImage,
    frame_index: usize,
    expected_dim: usize,
) -> Result<Option<FaceObservation>, VerifyError> {
    let faces = detector.detect(image)?;
    let observation = select_subject(faces, frame_index)?;

    if let Some(face) = &observation {
        if face.embedding.dim() != expected_dim {
            return Err(DetectorError::InvalidOutput(format!(
                "frame {frame_index}: embedding has {} values, expected {expected_dim}",
                face.embedding.dim()
            ))
            .into());
        }
        if !face.embedding.is_finite() {
            return Err(DetectorError::InvalidOutput(format!(
                "frame {frame_index}: embedding contains NaN/Inf"
            ))
            .into());
        }
    }
    Ok(observation)
}

/// Reduce a frame's detections to the single most confident face.
pub(crate) fn select_subject(
    faces: Vec<FaceObservation>,
    frame_index: usize,
) -> Result<Option<FaceObservation>, VerifyError> {
    if faces.len() > 1 {
        tracing::warn!(
            frame = frame_index,
            faces = faces.len(),
            "multiple faces detected, keeping highest confidence"
        );
    }
    if faces.iter().any(|f| !f.confidence.is_finite()) {
        return Err(DetectorError::InvalidOutput(format!(
            "frame {frame_index}: non-finite detection confidence"
        ))
        .into());
    }
    Ok(faces
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn face(confidence: f32, x: f32) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox {
                x1: x,
                y1: 0.0,
                x2: x + 100.0,
                y2: 100.0,
            },
            landmarks: None,
            confidence,
            embedding: Embedding::new(vec![0.0, 1.0, 0.0]),
        }
    }

    /// Encodes the frame's first red byte as the number of faces to return.
    struct PixelScriptedDetector {
        calls: AtomicUsize,
        dim: usize,
    }

    impl FaceDetector for PixelScriptedDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<FaceObservation>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let count = image.get_pixel(0, 0)[0] as usize;
            Ok((0..count)
                .map(|i| face(0.5 + i as f32 * 0.1, i as f32 * 10.0))
                .collect())
        }

        fn embedding_dim(&self) -> usize {
            self.dim
        }
    }

    fn frames(face_counts: &[u8]) -> Vec<Frame> {
        face_counts
            .iter()
            .enumerate()
            .map(|(index, &count)| Frame {
                index,
                timestamp_secs: index as f64 * 0.1,
                image: RgbImage::from_pixel(2, 2, image::Rgb([count, 0, 0])),
            })
            .collect()
    }

    #[test]
    fn one_detection_per_frame() {
        let detector = PixelScriptedDetector {
            calls: AtomicUsize::new(0),
            dim: 3,
        };
        let cache = FaceObservationCache::populate(&detector, frames(&[1, 0, 2, 1, 1]), 1).unwrap();

        assert_eq!(detector.calls.load(Ordering::SeqCst), 5);
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.valid_count(), 4);
        assert!(!cache.get(1).unwrap().is_present());

        // Reads never go back to the detector.
        for i in 0..5 {
            let _ = cache.get(i);
        }
        assert_eq!(detector.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn keeps_most_confident_face() {
        let detector = PixelScriptedDetector {
            calls: AtomicUsize::new(0),
            dim: 3,
        };
        let cache = FaceObservationCache::populate(&detector, frames(&[3]), 1).unwrap();
        let kept = cache.get(0).unwrap().observation.as_ref().unwrap();
        assert!((kept.confidence - 0.7).abs() < 1e-6);
        assert_eq!(kept.bbox.x1, 20.0);
    }

    #[test]
    fn parallel_population_preserves_order() {
        let detector = PixelScriptedDetector {
            calls: AtomicUsize::new(0),
            dim: 3,
        };
        let counts = [1, 0, 1, 1, 0, 1, 1, 1, 0, 1, 1, 1];
        let cache = FaceObservationCache::populate(&detector, frames(&counts), 4).unwrap();

        assert_eq!(detector.calls.load(Ordering::SeqCst), counts.len());
        let indices: Vec<usize> = cache.records().iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..counts.len()).collect::<Vec<_>>());
        for (record, &count) in cache.records().iter().zip(counts.iter()) {
            assert_eq!(record.is_present(), count > 0);
        }
    }

    #[test]
    fn wrong_embedding_dimension_is_rejected() {
        let detector = PixelScriptedDetector {
            calls: AtomicUsize::new(0),
            dim: 512,
        };
        let err = FaceObservationCache::populate(&detector, frames(&[1]), 1).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Detector(DetectorError::InvalidOutput(_))
        ));
    }

    #[test]
    fn from_records_sorts_by_index() {
        let cache = FaceObservationCache::from_records(vec![
            FrameRecord {
                index: 2,
                observation: None,
            },
            FrameRecord {
                index: 0,
                observation: Some(face(0.9, 0.0)),
            },
        ])
        .unwrap();
        assert_eq!(cache.records()[0].index, 0);
        assert!(cache.get(0).unwrap().is_present());
        assert!(cache.get(1).is_none());
        assert_eq!(cache.valid_count(), 1);
    }

    #[test]
    fn from_records_rejects_duplicate_index() {
        let err = FaceObservationCache::from_records(vec![
            FrameRecord {
                index: 3,
                observation: Some(face(0.9, 0.0)),
            },
            FrameRecord {
                index: 1,
                observation: None,
            },
            FrameRecord {
                index: 3,
                observation: Some(face(0.8, 5.0)),
            },
        ])
        .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidRecord { index: 3, .. }));
    }

    #[test]
    fn from_records_rejects_non_unit_embedding() {
        let mut scaled = face(0.9, 0.0);
        scaled.embedding = Embedding::new(vec![0.0, 3.0, 0.0]);
        let err = FaceObservationCache::from_records(vec![
            FrameRecord {
                index: 0,
                observation: Some(face(0.9, 0.0)),
            },
            FrameRecord {
                index: 1,
                observation: Some(scaled),
            },
        ])
        .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidRecord { index: 1, .. }));
        assert_eq!(err.kind(), "invalid_record");
    }

    #[test]
    fn from_records_rejects_mixed_dimensions() {
        let mut wide = face(0.9, 0.0);
        wide.embedding = Embedding::new(vec![0.0, 1.0, 0.0, 0.0]);
        let err = FaceObservationCache::from_records(vec![
            FrameRecord {
                index: 0,
                observation: Some(face(0.9, 0.0)),
            },
            FrameRecord {
                index: 1,
                observation: Some(wide),
            },
        ])
        .unwrap_err();
        assert_eq!(err, VerifyError::DimensionMismatch { left: 3, right: 4 });
    }
}
