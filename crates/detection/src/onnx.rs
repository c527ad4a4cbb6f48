//! ONNX Runtime detector.
//!
//! Wraps an SSD-style detection graph: one `image_tensor` input
//! (`uint8 [1, H, W, 3]`) and the `detection_boxes` / `detection_scores` /
//! `detection_classes` / `num_detections` output heads. Boxes come out as
//! `[ymin, xmin, ymax, xmax]` normalised to `[0, 1]`, which is what the
//! intrusion pipeline expects.

use crate::{DetectionError, Detector};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use video_analytics_common::Detection;

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// Path to the exported ONNX detection graph.
    pub model_path: PathBuf,
}

/// Object detector backed by an ONNX Runtime session.
///
/// `Session::run` needs exclusive access, so the session sits behind a
/// mutex; batches are processed image by image. Concurrency is already
/// bounded by the GPU pool tokens, so the lock is uncontended in practice.
pub struct OnnxDetector {
    session: Mutex<Session>,
}

impl OnnxDetector {
    /// Load the detection graph from disk.
    pub fn new(config: &OnnxConfig) -> Result<Self, DetectionError> {
        info!(model = %config.model_path.display(), "loading detection model");
        let session = Session::builder()
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?
            .commit_from_file(&config.model_path)
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?;
        info!("detection model loaded");
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Convenience constructor from a bare path.
    pub fn from_path(model_path: &Path) -> Result<Self, DetectionError> {
        Self::new(&OnnxConfig {
            model_path: model_path.to_path_buf(),
        })
    }

    fn detect_one(session: &mut Session, image: &RgbImage) -> Result<Detection, DetectionError> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let input = Array4::from_shape_vec((1, height, width, 3), image.as_raw().clone())
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectionError::Inference(e.to_string()))?;
        let outputs = session
            .run(ort::inputs!["image_tensor" => tensor])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        let extract = |name: &str| -> Result<Vec<f32>, DetectionError> {
            let value = outputs
                .get(name)
                .ok_or_else(|| DetectionError::Inference(format!("model has no '{name}' output")))?;
            let (_, data) = value.try_extract_tensor::<f32>().map_err(|e| {
                DetectionError::Inference(format!("output '{name}' not extractable: {e}"))
            })?;
            Ok(data.to_vec())
        };

        let boxes = extract("detection_boxes")?;
        let scores = extract("detection_scores")?;
        let classes = extract("detection_classes")?;
        let num = extract("num_detections")?
            .first()
            .copied()
            .unwrap_or(0.0)
            .max(0.0) as usize;

        Ok(assemble_detection(&boxes, &scores, &classes, num))
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, images: &[Arc<RgbImage>]) -> Result<Vec<Detection>, DetectionError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectionError::Inference("detector session poisoned".into()))?;

        // One graph run per image; the executor may batch internally in a
        // future model revision, the per-batch contract stays the same.
        images
            .iter()
            .map(|image| Self::detect_one(&mut session, image))
            .collect()
    }
}

/// Shape raw output head slices into a [`Detection`].
///
/// `num` is clamped to what the heads actually carry, so a graph reporting
/// more detections than it emitted cannot cause out-of-range reads.
fn assemble_detection(boxes: &[f32], scores: &[f32], classes: &[f32], num: usize) -> Detection {
    let valid = num.min(scores.len()).min(classes.len()).min(boxes.len() / 4);

    let mut detection = Detection {
        bboxes: Vec::with_capacity(valid),
        scores: scores[..valid].to_vec(),
        classes: classes[..valid].iter().map(|&c| c as i64).collect(),
        num: valid,
    };
    for i in 0..valid {
        detection
            .bboxes
            .push([boxes[i * 4], boxes[i * 4 + 1], boxes[i * 4 + 2], boxes[i * 4 + 3]]);
    }
    detection
}
