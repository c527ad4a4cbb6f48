//! Object-detection dispatch.
//!
//! The analyzer loop submits motion-filtered frame batches here; the
//! dispatch runs the detector on the shared GPU worker pool and returns
//! per-image detections positionally aligned with the input. The detector
//! itself is a seam: production uses an ONNX Runtime session
//! ([`OnnxDetector`]), tests substitute scripted implementations.

mod labels;
mod onnx;

pub use labels::{load_label_index, LabelIndex};
pub use onnx::{OnnxConfig, OnnxDetector};

use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use video_analytics_common::{Detection, Frame, PoolError, WorkerPool};

/// Errors from detection dispatch.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("label index error: {0}")]
    Labels(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A detection model: images in, per-image detections out.
///
/// The returned vector is positionally aligned with the input slice.
pub trait Detector: Send + Sync {
    fn detect(&self, images: &[Arc<RgbImage>]) -> Result<Vec<Detection>, DetectionError>;
}

/// Submits detection batches to the GPU executor pool.
///
/// One submission per batch; the pool grants a `GPU` slot, inference runs on
/// the blocking thread pool, and the caller awaits the result. Dropping the
/// await (driver stop) abandons the submission — in-flight inference
/// completes in the background and its result is discarded.
#[derive(Clone)]
pub struct DetectionDispatch {
    detector: Arc<dyn Detector>,
    pool: WorkerPool,
}

impl DetectionDispatch {
    #[must_use]
    pub fn new(detector: Arc<dyn Detector>, pool: WorkerPool) -> Self {
        Self { detector, pool }
    }

    /// Detect objects in `frames`, aligned positionally with the input.
    pub async fn detect(&self, frames: &[Frame]) -> Result<Vec<Detection>, DetectionError> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let images: Vec<Arc<RgbImage>> = frames.iter().map(|f| Arc::clone(&f.image)).collect();
        let detector = Arc::clone(&self.detector);

        let detections = self
            .pool
            .submit(move || detector.detect(&images))
            .await??;

        debug!(
            batch = frames.len(),
            results = detections.len(),
            "detection batch complete"
        );
        Ok(detections)
    }

    /// Shut the dispatch down; pending submissions fail.
    pub fn close(&self) {
        self.pool.close();
    }
}
