//! The face detection capability and the worker that serializes access to
//! a single model instance.
//!
//! Detection internals (detector architecture, embedding space) live behind
//! these traits. A detector safe for concurrent read-only inference
//! implements [`FaceDetector`] directly. A model that needs `&mut self`
//! (an inference session, for example) implements [`ExclusiveDetector`] and
//! is moved onto a dedicated thread with [`spawn_detection_worker`]; callers
//! then queue behind it through a cloneable [`DetectorHandle`].

use image::RgbImage;
use tokio::sync::{mpsc, oneshot};

use crate::error::DetectorError;
use crate::types::FaceObservation;

/// Process-wide, read-only face detection capability.
pub trait FaceDetector: Send + Sync {
    /// Detect every face in `image`. An empty result means no face.
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceObservation>, DetectorError>;

    /// Length of the embeddings this detector produces.
    fn embedding_dim(&self) -> usize;

    /// Whether the capability can currently serve requests.
    fn is_ready(&self) -> bool {
        true
    }
}

/// A detector that must be driven from one thread at a time.
pub trait ExclusiveDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, DetectorError>;

    fn embedding_dim(&self) -> usize;
}

struct DetectRequest {
    image: RgbImage,
    reply: oneshot::Sender<Result<Vec<FaceObservation>, DetectorError>>,
}

/// Clone-safe handle to the detection worker thread.
///
/// Calls block the current thread until the worker replies, so they must not
/// be made from inside an async runtime; use `spawn_blocking` there.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<DetectRequest>,
    embedding_dim: usize,
}

impl FaceDetector for DetectorHandle {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceObservation>, DetectorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(DetectRequest {
                image: image.clone(),
                reply: reply_tx,
            })
            .map_err(|_| worker_gone())?;
        reply_rx.blocking_recv().map_err(|_| worker_gone())?
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn is_ready(&self) -> bool {
        !self.tx.is_closed()
    }
}

fn worker_gone() -> DetectorError {
    DetectorError::Unavailable("detection worker exited".to_string())
}

/// Move `detector` onto a dedicated OS thread and return a handle to it.
///
/// At most `queue_depth` requests wait in line; further callers block until
/// a slot frees up. The worker exits once every handle is dropped.
pub fn spawn_detection_worker<E>(
    mut detector: E,
    queue_depth: usize,
) -> Result<DetectorHandle, DetectorError>
where
    E: ExclusiveDetector + 'static,
{
    let embedding_dim = detector.embedding_dim();
    let (tx, mut rx) = mpsc::channel::<DetectRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("livecheck-detector".into())
        .spawn(move || {
            tracing::info!(embedding_dim, "detection worker started");
            let mut served = 0u64;
            while let Some(req) = rx.blocking_recv() {
                let result = detector.detect(&req.image);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "detection failed");
                }
                served += 1;
                // Caller may have given up (timeout); nothing to do then.
                let _ = req.reply.send(result);
            }
            tracing::info!(served, "detection worker exiting");
        })
        .map_err(|e| DetectorError::Unavailable(format!("failed to spawn detection worker: {e}")))?;

    Ok(DetectorHandle { tx, embedding_dim })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    /// Returns one face whose confidence encodes how many calls came before.
    struct SequencedDetector {
        calls: usize,
    }

    impl ExclusiveDetector for SequencedDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceObservation>, DetectorError> {
            self.calls += 1;
            Ok(vec![FaceObservation {
                bbox: BoundingBox {
                    x1: 0.0,
                    y1: 0.0,
                    x2: image.width() as f32,
                    y2: image.height() as f32,
                },
                landmarks: None,
                confidence: self.calls as f32 / 100.0,
                embedding: Embedding::new(vec![1.0, 0.0]),
            }])
        }

        fn embedding_dim(&self) -> usize {
            2
        }
    }

    struct PanickingDetector;

    impl ExclusiveDetector for PanickingDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceObservation>, DetectorError> {
            panic!("model crashed");
        }

        fn embedding_dim(&self) -> usize {
            2
        }
    }

    #[test]
    fn handle_forwards_to_worker() {
        let handle = spawn_detection_worker(SequencedDetector { calls: 0 }, 2).unwrap();
        assert!(handle.is_ready());
        assert_eq!(handle.embedding_dim(), 2);

        let image = RgbImage::new(8, 6);
        let faces = handle.detect(&image).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox.x2, 8.0);
        assert_eq!(faces[0].bbox.y2, 6.0);
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let handle = spawn_detection_worker(SequencedDetector { calls: 0 }, 1).unwrap();
        let image = RgbImage::new(4, 4);

        let mut confidences: Vec<f32> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let handle = handle.clone();
                    let image = &image;
                    s.spawn(move || handle.detect(image).unwrap()[0].confidence)
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        confidences.sort_by(|a, b| a.partial_cmp(b).unwrap());

        // Each call saw a distinct call counter: no two ran at once.
        assert_eq!(confidences, vec![0.01, 0.02, 0.03, 0.04]);
    }

    #[test]
    fn crashed_worker_reports_unavailable() {
        let handle = spawn_detection_worker(PanickingDetector, 1).unwrap();
        let image = RgbImage::new(4, 4);

        let err = handle.detect(&image).unwrap_err();
        assert!(matches!(err, DetectorError::Unavailable(_)));

        let err = handle.detect(&image).unwrap_err();
        assert!(matches!(err, DetectorError::Unavailable(_)));
        assert!(!handle.is_ready());
    }
}
