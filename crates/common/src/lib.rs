/// Common types and utilities for the video-analytics runtime
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod geometry;
pub mod pool;

pub use pool::{PoolError, WorkerPool};

/// A single captured video frame.
///
/// The pixel buffer is reference-counted: frames are cloned into motion
/// results, pre-roll rings and clip writers, and must stay cheap to copy.
/// Immutable once captured.
#[derive(Debug, Clone)]
pub struct Frame {
    /// H×W×3 interleaved RGB pixels.
    pub image: Arc<RgbImage>,

    /// Capture time in seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Frame {
    /// Wrap an image captured at an explicit timestamp.
    #[must_use]
    pub fn new(image: RgbImage, timestamp: f64) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
        }
    }

    /// Wrap an image captured right now.
    #[must_use]
    pub fn captured_now(image: RgbImage) -> Self {
        Self::new(image, epoch_seconds())
    }

    /// Frame dimensions as (width, height).
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

/// Seconds since the Unix epoch as a float.
#[must_use]
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// An ordered batch of frames in capture order; never re-sorted.
pub type FrameBatch = Vec<Frame>;

/// Frames of a batch that carry motion, plus their positions in the input.
///
/// `index[k]` is the position of `frames[k]` in the original batch.
/// `frames[0]` is always the first input frame (the anchor), regardless of
/// motion, so downstream stages have a reference frame.
#[derive(Debug, Clone, Default)]
pub struct MotionResult {
    pub frames: Vec<Frame>,
    pub index: Vec<usize>,
}

impl MotionResult {
    /// Whether the input batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Position of `batch_index` within `frames`, if that frame had motion.
    #[must_use]
    pub fn position_of(&self, batch_index: usize) -> Option<usize> {
        self.index.iter().position(|&i| i == batch_index)
    }
}

/// Raw model output for one image.
///
/// Boxes are `[ymin, xmin, ymax, xmax]` normalised to `[0, 1]`; `classes`
/// are model class ids resolved against the label index downstream. The
/// three vectors are aligned and `num` is the number of valid entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub bboxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub classes: Vec<i64>,
    pub num: usize,
}

/// State of the intrusion detector for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorMode {
    Normal,
    AlertStart,
    Alerting,
    AlertEnd,
}

impl DetectorMode {
    /// Whether the clip agent should be recording in this mode.
    #[must_use]
    pub fn is_alerting(self) -> bool {
        matches!(self, DetectorMode::AlertStart | DetectorMode::Alerting)
    }
}

/// Per-frame event metadata attached by a pipeline.
///
/// Frames skipped by the motion filter carry only the mode; the vectors
/// stay empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub bboxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub labels: Vec<String>,
    pub mode: DetectorMode,
}

impl FrameMetadata {
    /// Metadata for a frame with no matched detections.
    #[must_use]
    pub fn empty(mode: DetectorMode) -> Self {
        Self {
            bboxes: Vec::new(),
            scores: Vec::new(),
            labels: Vec::new(),
            mode,
        }
    }
}

/// A frame annotated with the pipeline state it was observed under.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub metadata: FrameMetadata,
}

/// Alert emitted when a pipeline starts recording an event clip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Event name, e.g. `intrusion_detection.alert`.
    pub name: String,

    /// Object-store key of the clip video.
    pub video_key: String,

    /// Object-store key of the clip metadata JSON.
    pub metadata_key: String,

    /// Object-store key of the thumbnail image.
    pub thumbnail_key: String,

    /// Timestamp of the first recorded frame (seconds since epoch).
    pub timestamp: f64,

    /// Labels that triggered the alert.
    pub triggered: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame(ts: f64) -> Frame {
        Frame::new(RgbImage::new(4, 4), ts)
    }

    #[test]
    fn test_frame_clone_shares_pixels() {
        let frame = blank_frame(1.0);
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.image, &copy.image));
        assert_eq!(copy.size(), (4, 4));
    }

    #[test]
    fn test_motion_result_position_of() {
        let result = MotionResult {
            frames: vec![blank_frame(0.0), blank_frame(1.0)],
            index: vec![0, 3],
        };
        assert_eq!(result.position_of(3), Some(1));
        assert_eq!(result.position_of(2), None);
    }

    #[test]
    fn test_detector_mode_serialises_snake_case() {
        let json = serde_json::to_string(&DetectorMode::AlertStart).unwrap();
        assert_eq!(json, "\"alert_start\"");
        let back: DetectorMode = serde_json::from_str("\"alert_end\"").unwrap();
        assert_eq!(back, DetectorMode::AlertEnd);
    }

    #[test]
    fn test_recording_modes() {
        assert!(DetectorMode::AlertStart.is_alerting());
        assert!(DetectorMode::Alerting.is_alerting());
        assert!(!DetectorMode::Normal.is_alerting());
        assert!(!DetectorMode::AlertEnd.is_alerting());
    }
}
