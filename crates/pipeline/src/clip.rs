//! Event-clip recording.
//!
//! While a pipeline is idle the agent keeps a pre-roll ring of the most
//! recent frames. When the detector enters `AlertStart` the ring is flushed
//! into a freshly opened clip writer, every subsequent frame is appended,
//! and on `AlertEnd` the clip, its metadata JSON and a thumbnail are pushed
//! to the object store. At most one writer is open per agent at any time.

use crate::RoiPoint;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use video_analytics_common::{AlertEvent, AnnotatedFrame, DetectorMode, Frame, FrameMetadata};
use video_analytics_sinks::ObjectStore;
use video_analytics_stream::{StreamWriter, WriterError};

/// ROI overlay colour on thumbnails.
const OVERLAY_COLOR: Rgb<u8> = Rgb([244, 194, 66]);

/// Clip recording configuration.
#[derive(Debug, Clone)]
pub struct ClipConfig {
    /// Container/extension of event clips.
    pub video_format: String,

    /// Output frame rate.
    pub fps: u32,

    /// Pre-roll kept while idle, in seconds.
    pub history_seconds: u32,

    /// Post-roll retained after the last hit, in seconds.
    pub post_roll_seconds: u32,

    /// Where clips are staged before upload.
    pub staging_dir: PathBuf,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            video_format: "mp4".to_string(),
            fps: 15,
            history_seconds: 3,
            post_roll_seconds: 3,
            staging_dir: std::env::temp_dir(),
        }
    }
}

/// Sink side of a clip writer; lets tests run the agent without a codec.
pub trait ClipWriter: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), WriterError>;
    fn end(&mut self) -> Result<(), WriterError>;
}

impl ClipWriter for StreamWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), WriterError> {
        StreamWriter::write(self, frame)
    }

    fn end(&mut self) -> Result<(), WriterError> {
        StreamWriter::end(self)
    }
}

/// Opens clip writers; one writer per event clip.
pub trait ClipWriterFactory: Send + Sync {
    fn open(
        &self,
        path: &Path,
        fps: u32,
        size: (u32, u32),
    ) -> Result<Box<dyn ClipWriter>, WriterError>;
}

/// Production factory producing H.264/MP4 writers.
pub struct Mp4WriterFactory;

impl ClipWriterFactory for Mp4WriterFactory {
    fn open(
        &self,
        path: &Path,
        fps: u32,
        size: (u32, u32),
    ) -> Result<Box<dyn ClipWriter>, WriterError> {
        Ok(Box::new(StreamWriter::open(path, fps, size)?))
    }
}

/// Clip metadata written alongside every event video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipMetadata {
    pub fps: u32,
    pub start: f64,
    pub end: Option<f64>,
    pub event_name: String,
    pub custom: ClipCustom,
    pub frames: Vec<FrameMetadata>,
}

/// Event-specific metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipCustom {
    pub roi: Vec<RoiPoint>,
}

struct ActiveClip {
    writer: Box<dyn ClipWriter>,
    metadata: ClipMetadata,
    video_key: String,
    metadata_key: String,
    thumbnail_key: String,
    staging_path: PathBuf,
    thumbnail: RgbImage,
    last_timestamp: f64,
}

/// Pre-roll ring plus active clip recording, driven by detector modes.
pub struct EventClipAgent {
    analyzer_id: String,
    key_prefix: String,
    event_name: String,
    roi: Vec<RoiPoint>,
    frame_size: (u32, u32),
    config: ClipConfig,
    history: VecDeque<AnnotatedFrame>,
    max_history: usize,
    active: Option<ActiveClip>,
    store: Arc<dyn ObjectStore>,
    writer_factory: Arc<dyn ClipWriterFactory>,
}

impl EventClipAgent {
    #[must_use]
    pub fn new(
        analyzer_id: &str,
        pipeline_kind: &str,
        event_name: &str,
        roi: Vec<RoiPoint>,
        frame_size: (u32, u32),
        config: ClipConfig,
        store: Arc<dyn ObjectStore>,
        writer_factory: Arc<dyn ClipWriterFactory>,
    ) -> Self {
        let max_history = (config.fps * config.history_seconds).max(1) as usize;
        Self {
            analyzer_id: analyzer_id.to_string(),
            key_prefix: format!("{pipeline_kind}/{analyzer_id}"),
            event_name: event_name.to_string(),
            roi,
            frame_size,
            config,
            history: VecDeque::with_capacity(max_history),
            max_history,
            active: None,
            store,
            writer_factory,
        }
    }

    /// Whether a clip writer is currently open.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Feed one annotated frame through the recording policy.
    ///
    /// Returns the alert event when a new clip starts. Writer failures abort
    /// the current clip and surface as `Err`; the caller resets its detector
    /// to keep the recording ⇔ alerting invariant.
    pub async fn step(&mut self, annotated: &AnnotatedFrame) -> Result<Option<AlertEvent>, WriterError> {
        if self.active.is_none() {
            self.push_history(annotated.clone());
            if annotated.metadata.mode == DetectorMode::AlertStart {
                let event = self.start_clip(annotated)?;
                return Ok(Some(event));
            }
            return Ok(None);
        }

        self.append(annotated)?;
        if annotated.metadata.mode == DetectorMode::AlertEnd {
            self.finish_clip(annotated.frame.timestamp).await?;
        }
        Ok(None)
    }

    /// Finalise any open clip and drop the pre-roll; runs on every analyzer
    /// exit path, so a deleted analyzer never leaves a torn clip behind.
    pub async fn release(&mut self) {
        if self.active.is_some() {
            let end = self.active.as_ref().map_or(0.0, |c| c.last_timestamp);
            if let Err(e) = self.finish_clip(end).await {
                error!(analyzer = %self.analyzer_id, "failed to finalise clip on release: {e}");
            }
        }
        self.history.clear();
    }

    fn push_history(&mut self, annotated: AnnotatedFrame) {
        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(annotated);
    }

    /// Open a writer, flush the pre-roll (which includes the triggering
    /// frame) and emit the alert event.
    fn start_clip(&mut self, trigger: &AnnotatedFrame) -> Result<AlertEvent, WriterError> {
        let timestamp = trigger.frame.timestamp;
        let base = format!("{}/{}", self.key_prefix, timestamp);
        let video_key = format!("{base}.{}", self.config.video_format);
        let metadata_key = format!("{base}.json");
        let thumbnail_key = format!("{base}.jpg");
        let staging_path = self.config.staging_dir.join(&video_key);

        let mut writer =
            self.writer_factory
                .open(&staging_path, self.config.fps, self.frame_size)?;

        let mut metadata = ClipMetadata {
            fps: self.config.fps,
            start: timestamp,
            end: None,
            event_name: self.event_name.clone(),
            custom: ClipCustom {
                roi: self.roi.clone(),
            },
            frames: Vec::new(),
        };

        // First recorded frame becomes the thumbnail, with the region drawn
        // on top.
        let first = self
            .history
            .front()
            .map_or_else(|| trigger.frame.clone(), |af| af.frame.clone());
        let thumbnail = thumbnail_with_overlay(&first.image, &self.roi);

        let flushed: Vec<AnnotatedFrame> = self.history.drain(..).collect();
        let mut last_timestamp = timestamp;
        for af in flushed {
            if let Err(e) = writer.write(&af.frame) {
                let _ = writer.end();
                let _ = std::fs::remove_file(&staging_path);
                return Err(e);
            }
            last_timestamp = af.frame.timestamp;
            metadata.frames.push(af.metadata);
        }

        let triggered = dedup_labels(&trigger.metadata.labels);
        info!(
            analyzer = %self.analyzer_id,
            video = %video_key,
            ?triggered,
            "recording event clip"
        );

        self.active = Some(ActiveClip {
            writer,
            metadata,
            video_key: video_key.clone(),
            metadata_key: metadata_key.clone(),
            thumbnail_key: thumbnail_key.clone(),
            staging_path,
            thumbnail,
            last_timestamp,
        });

        Ok(AlertEvent {
            name: self.event_name.clone(),
            video_key,
            metadata_key,
            thumbnail_key,
            timestamp,
            triggered,
        })
    }

    fn append(&mut self, annotated: &AnnotatedFrame) -> Result<(), WriterError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if let Err(e) = active.writer.write(&annotated.frame) {
            error!(analyzer = %self.analyzer_id, "clip write failed, aborting clip: {e}");
            self.abort_clip();
            return Err(e);
        }
        active.last_timestamp = annotated.frame.timestamp;
        active.metadata.frames.push(annotated.metadata.clone());
        Ok(())
    }

    /// Close the writer and push clip, metadata and thumbnail to the store.
    ///
    /// Store failures are logged and swallowed: losing an upload must not
    /// take the analyzer down.
    async fn finish_clip(&mut self, end_timestamp: f64) -> Result<(), WriterError> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        active.metadata.end = Some(end_timestamp);

        if let Err(e) = active.writer.end() {
            error!(analyzer = %self.analyzer_id, "clip finalisation failed: {e}");
            let _ = std::fs::remove_file(&active.staging_path);
            return Err(e);
        }

        if let Err(e) = self
            .store
            .store_file(&active.video_key, &active.staging_path)
            .await
        {
            error!("failed to store clip {}: {e}", active.video_key);
        } else {
            info!("saved video: {}", active.video_key);
        }

        match serde_json::to_value(&active.metadata) {
            Ok(json) => {
                if let Err(e) = self.store.store_json(&active.metadata_key, &json).await {
                    error!("failed to store clip metadata {}: {e}", active.metadata_key);
                } else {
                    info!("saved video metadata: {}", active.metadata_key);
                }
            }
            Err(e) => error!("clip metadata did not serialise: {e}"),
        }

        if let Err(e) = self
            .store
            .store_jpeg(&active.thumbnail_key, &active.thumbnail)
            .await
        {
            error!("failed to store thumbnail {}: {e}", active.thumbnail_key);
        }

        if let Err(e) = std::fs::remove_file(&active.staging_path) {
            warn!(
                "could not remove staged clip {}: {e}",
                active.staging_path.display()
            );
        }
        Ok(())
    }

    /// Drop the current clip without uploading anything.
    fn abort_clip(&mut self) {
        if let Some(mut active) = self.active.take() {
            let _ = active.writer.end();
            let _ = std::fs::remove_file(&active.staging_path);
        }
    }
}

fn dedup_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        if !out.contains(label) {
            out.push(label.clone());
        }
    }
    out
}

/// Copy of `image` with the ROI polygon outline drawn on top.
fn thumbnail_with_overlay(image: &RgbImage, roi: &[RoiPoint]) -> RgbImage {
    let mut canvas = image.clone();
    if roi.len() < 2 {
        return canvas;
    }
    let (w, h) = (f64::from(image.width()), f64::from(image.height()));
    let px: Vec<(f32, f32)> = roi
        .iter()
        .map(|p| ((p.x * w) as f32, (p.y * h) as f32))
        .collect();
    for i in 0..px.len() {
        let a = px[i];
        let b = px[(i + 1) % px.len()];
        draw_line_segment_mut(&mut canvas, a, b, OVERLAY_COLOR);
    }
    canvas
}
