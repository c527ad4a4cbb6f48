//! Intrusion detection: trigger filtering, ROI containment and the per-frame
//! alert state machine.

use crate::clip::EventClipAgent;
use crate::{AnalysisPipeline, IntrusionParams, PipelineContext, PipelineError, RoiPoint};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};
use video_analytics_common::geometry::{rect_overlaps, Point, Rect};
use video_analytics_common::{
    AlertEvent, AnnotatedFrame, Detection, DetectorMode, Frame, FrameMetadata, MotionResult,
};
use video_analytics_detection::LabelIndex;

/// Event name carried by alerts and clip metadata.
pub const EVENT_NAME: &str = "intrusion_detection.alert";

/// Storage key segment for this pipeline type.
const KEY_SEGMENT: &str = "intrusion_detection";

/// Default score threshold for a detection to participate at all.
const DEFAULT_DETECT_THRESHOLD: f32 = 0.25;

/// Intrusion detector configuration.
#[derive(Debug, Clone)]
pub struct IntrusionConfig {
    /// Region of interest, normalised points.
    pub roi: Vec<RoiPoint>,

    /// Labels that count as intruders.
    pub triggers: HashSet<String>,

    /// Minimum detection score, in `(0, 1]`.
    pub detect_threshold: f32,

    /// Frame rate used to size the post-roll window.
    pub fps: u32,

    /// Seconds of idle frames before an alert ends.
    pub post_roll_seconds: u32,
}

impl Default for IntrusionConfig {
    fn default() -> Self {
        Self {
            roi: Vec::new(),
            triggers: HashSet::new(),
            detect_threshold: DEFAULT_DETECT_THRESHOLD,
            fps: 15,
            post_roll_seconds: 3,
        }
    }
}

/// Detections of one motion frame that satisfied trigger ∩ ROI ∩ score.
#[derive(Debug, Clone, Default)]
struct Matches {
    bboxes: Vec<[f32; 4]>,
    scores: Vec<f32>,
    labels: Vec<String>,
}

impl Matches {
    fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Per-analyzer intrusion state machine.
///
/// Advances once per input frame:
///
/// ```text
/// NORMAL        --catched-->    ALERT_START
/// ALERT_START   --(1 step)-->   ALERTING      (post-roll reset)
/// ALERTING      --catched-->    ALERTING      (post-roll reset)
/// ALERTING      --idle<max-->   ALERTING      (post-roll += 1)
/// ALERTING      --idle>=max-->  ALERT_END
/// ALERT_END     --catched-->    ALERT_START
/// ALERT_END     --idle-->       NORMAL
/// ```
pub struct IntrusionDetector {
    roi_px: Vec<Point>,
    triggers: HashSet<String>,
    threshold: f32,
    labels: Arc<LabelIndex>,
    frame_size: (u32, u32),
    mode: DetectorMode,
    post_roll: u32,
    max_post_roll: u32,
}

impl IntrusionDetector {
    #[must_use]
    pub fn new(config: &IntrusionConfig, frame_size: (u32, u32), labels: Arc<LabelIndex>) -> Self {
        let (w, h) = (f64::from(frame_size.0), f64::from(frame_size.1));
        let roi_px = config
            .roi
            .iter()
            .map(|p| Point::new(p.x * w, p.y * h))
            .collect();
        info!(
            roi = ?config.roi,
            triggers = ?config.triggers,
            threshold = config.detect_threshold,
            "created intrusion detector"
        );
        Self {
            roi_px,
            triggers: config.triggers.clone(),
            threshold: config.detect_threshold,
            labels,
            frame_size,
            mode: DetectorMode::Normal,
            post_roll: 0,
            max_post_roll: (config.fps * config.post_roll_seconds).max(1),
        }
    }

    /// Current state.
    #[must_use]
    pub fn mode(&self) -> DetectorMode {
        self.mode
    }

    /// Force the machine back to NORMAL (clip abort path).
    pub fn reset(&mut self) {
        self.mode = DetectorMode::Normal;
        self.post_roll = 0;
    }

    /// Process one batch: annotate every input frame, in input order.
    pub fn step(
        &mut self,
        batch: &[Frame],
        motion: &MotionResult,
        detections: &[Detection],
    ) -> Vec<AnnotatedFrame> {
        let matches = self.check_intrusion(detections);

        batch
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let matched = motion.position_of(i).and_then(|k| matches.get(k));
                let catched = matched.is_some_and(|m| !m.is_empty());
                let mode = self.advance(catched);
                let metadata = match matched {
                    Some(m) if !m.is_empty() => FrameMetadata {
                        bboxes: m.bboxes.clone(),
                        scores: m.scores.clone(),
                        labels: m.labels.clone(),
                        mode,
                    },
                    _ => FrameMetadata::empty(mode),
                };
                AnnotatedFrame {
                    frame: frame.clone(),
                    metadata,
                }
            })
            .collect()
    }

    fn advance(&mut self, catched: bool) -> DetectorMode {
        self.mode = match self.mode {
            DetectorMode::Normal => {
                if catched {
                    self.post_roll = 0;
                    DetectorMode::AlertStart
                } else {
                    DetectorMode::Normal
                }
            }
            DetectorMode::AlertStart | DetectorMode::Alerting => {
                if catched {
                    self.post_roll = 0;
                    DetectorMode::Alerting
                } else {
                    self.post_roll += 1;
                    if self.post_roll >= self.max_post_roll {
                        DetectorMode::AlertEnd
                    } else {
                        DetectorMode::Alerting
                    }
                }
            }
            DetectorMode::AlertEnd => {
                if catched {
                    self.post_roll = 0;
                    DetectorMode::AlertStart
                } else {
                    DetectorMode::Normal
                }
            }
        };
        self.mode
    }

    /// Filter detections by score, trigger label and ROI overlap.
    ///
    /// Detections with a class id missing from the label index are skipped
    /// silently. A bbox counts only when its rectangle and the ROI polygon
    /// overlap with positive area.
    fn check_intrusion(&self, detections: &[Detection]) -> Vec<Matches> {
        let (w, h) = (f64::from(self.frame_size.0), f64::from(self.frame_size.1));

        detections
            .iter()
            .map(|det| {
                let mut matches = Matches::default();
                let valid = det
                    .num
                    .min(det.scores.len())
                    .min(det.classes.len())
                    .min(det.bboxes.len());
                for j in 0..valid {
                    if det.scores[j] < self.threshold {
                        continue;
                    }
                    let Some(label) = self.labels.get(&det.classes[j]) else {
                        continue;
                    };
                    if !self.triggers.contains(label) {
                        continue;
                    }
                    let [ymin, xmin, ymax, xmax] = det.bboxes[j];
                    let rect = Rect::new(
                        f64::from(xmin) * w,
                        f64::from(ymin) * h,
                        f64::from(xmax) * w,
                        f64::from(ymax) * h,
                    );
                    if rect_overlaps(&self.roi_px, rect) {
                        matches.bboxes.push(det.bboxes[j]);
                        matches.scores.push(det.scores[j]);
                        matches.labels.push(label.clone());
                    }
                }
                matches
            })
            .collect()
    }
}

/// Intrusion pipeline: detector state machine plus event-clip recording.
pub struct IntrusionPipeline {
    detector: IntrusionDetector,
    agent: EventClipAgent,
}

impl IntrusionPipeline {
    pub fn new(params: &IntrusionParams, ctx: &PipelineContext) -> Result<Self, PipelineError> {
        let config = IntrusionConfig {
            roi: params.roi.clone(),
            triggers: params.trigger_set(),
            detect_threshold: DEFAULT_DETECT_THRESHOLD,
            fps: ctx.clip.fps,
            post_roll_seconds: ctx.clip.post_roll_seconds,
        };
        let detector = IntrusionDetector::new(&config, ctx.frame_size, Arc::clone(&ctx.labels));
        let agent = EventClipAgent::new(
            &ctx.analyzer_id,
            KEY_SEGMENT,
            EVENT_NAME,
            params.roi.clone(),
            ctx.frame_size,
            ctx.clip.clone(),
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.writer_factory),
        );
        Ok(Self { detector, agent })
    }
}

#[async_trait::async_trait]
impl AnalysisPipeline for IntrusionPipeline {
    fn kind(&self) -> &'static str {
        "IntrusionDetection"
    }

    async fn step(
        &mut self,
        batch: &[Frame],
        motion: &MotionResult,
        detections: &[Detection],
    ) -> Vec<AlertEvent> {
        let annotated = self.detector.step(batch, motion, detections);
        let mut events = Vec::new();
        for af in &annotated {
            match self.agent.step(af).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    // Clip writer failure: the clip is gone, bring the state
                    // machine back so recording ⇔ alerting stays true.
                    error!("clip recording aborted: {e}");
                    self.detector.reset();
                }
            }
        }
        events
    }

    async fn release(&mut self) {
        self.agent.release().await;
    }
}
