//! Per-analyzer detection pipelines.
//!
//! A pipeline consumes frame batches (with their motion result and raw
//! detections), advances its own event logic, and materialises event clips.
//! Pipelines are built from declarative specs by a factory keyed on the
//! spec's `type` tag; `IntrusionDetection` is the only registered type.

mod clip;
mod intrusion;

pub use clip::{ClipConfig, ClipWriter, ClipWriterFactory, EventClipAgent, Mp4WriterFactory};
pub use intrusion::{IntrusionConfig, IntrusionDetector, IntrusionPipeline};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use video_analytics_common::{AlertEvent, Detection, Frame, MotionResult};
use video_analytics_detection::LabelIndex;
use video_analytics_sinks::ObjectStore;

/// Pipeline construction/validation errors, surfaced to the RPC caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Validation(String),
}

/// A point of a region-of-interest polygon, normalised to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiPoint {
    pub x: f64,
    pub y: f64,
}

/// Declarative pipeline spec, as carried in CREATE/UPDATE requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum PipelineSpec {
    IntrusionDetection(IntrusionParams),
}

/// Parameters of an intrusion-detection pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrusionParams {
    /// Closed polygon, ≥ 3 normalised points.
    pub roi: Vec<RoiPoint>,

    /// Class labels that participate in intrusion (e.g. `person`).
    pub triggers: Vec<String>,
}

impl IntrusionParams {
    /// Validate the ROI and triggers.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.roi.len() < 3 {
            return Err(PipelineError::Validation(format!(
                "roi must have at least 3 points, got {}",
                self.roi.len()
            )));
        }
        for (i, p) in self.roi.iter().enumerate() {
            if !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y) {
                return Err(PipelineError::Validation(format!(
                    "roi point {i} ({}, {}) is outside [0, 1]",
                    p.x, p.y
                )));
            }
        }
        if self.triggers.is_empty() {
            return Err(PipelineError::Validation(
                "triggers must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn trigger_set(&self) -> HashSet<String> {
        self.triggers.iter().cloned().collect()
    }
}

/// Uniform interface over pipeline variants.
///
/// `step` consumes one batch together with its motion result and the
/// positionally aligned detections, and returns the alert events raised by
/// this batch. `release` finalises any in-flight clip; it runs on every
/// driver exit path.
#[async_trait::async_trait]
pub trait AnalysisPipeline: Send {
    /// The spec type tag this pipeline was built from.
    fn kind(&self) -> &'static str;

    async fn step(
        &mut self,
        batch: &[Frame],
        motion: &MotionResult,
        detections: &[Detection],
    ) -> Vec<AlertEvent>;

    async fn release(&mut self);
}

/// Everything a pipeline needs from its analyzer at construction time.
pub struct PipelineContext {
    pub analyzer_id: String,
    pub frame_size: (u32, u32),
    pub labels: Arc<LabelIndex>,
    pub clip: ClipConfig,
    pub store: Arc<dyn ObjectStore>,
    pub writer_factory: Arc<dyn ClipWriterFactory>,
}

/// Build pipelines from specs.
///
/// The spec's `type` tag selects the variant; unknown tags are rejected at
/// deserialisation, malformed parameters here.
pub fn build_pipelines(
    specs: &[PipelineSpec],
    ctx: &PipelineContext,
) -> Result<Vec<Box<dyn AnalysisPipeline>>, PipelineError> {
    specs
        .iter()
        .map(|spec| match spec {
            PipelineSpec::IntrusionDetection(params) => {
                params.validate()?;
                let pipeline = IntrusionPipeline::new(params, ctx)?;
                Ok(Box::new(pipeline) as Box<dyn AnalysisPipeline>)
            }
        })
        .collect()
}
