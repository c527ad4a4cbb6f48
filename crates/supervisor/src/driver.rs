//! Per-analyzer driver: the worker loop run by `analyticsd driver`.
//!
//! The driver lives in its own process. It receives its analyzer spec as
//! the first stdin line, reports `ready` / `source_down` / `internal_error`
//! on stdout, and honours a single `stop` line on stdin, checked at the top
//! of every loop iteration. Everything it owns — reader, pipelines,
//! dispatch — is torn down on every exit path.

use crate::analyzer::AnalyzerSpec;
use crate::config::RuntimeConfig;
use crate::process::DriverMessage;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use video_analytics_common::WorkerPool;
use video_analytics_detection::{load_label_index, DetectionDispatch, Detector, OnnxDetector};
use video_analytics_motion::detect_motion;
use video_analytics_pipeline::{
    build_pipelines, AnalysisPipeline, Mp4WriterFactory, PipelineContext,
};
use video_analytics_sinks::{
    EventSinks, EventStore, NatsNotifier, Notifier, ObjectStore, PostgresEventStore, S3ObjectStore,
};
use video_analytics_stream::{StreamError, StreamReader, VideoInfo};

/// How the analysis loop came to an end.
enum LoopOutcome {
    Stopped,
    EndOfVideo,
    SourceDown,
    Internal(anyhow::Error),
}

/// Driver process entry point.
pub async fn run_driver(config: &RuntimeConfig) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let first = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("no analyzer spec on stdin"))?;
    let spec: AnalyzerSpec = serde_json::from_str(&first)
        .map_err(|e| anyhow::anyhow!("invalid analyzer spec: {e}"))?;

    info!(analyzer = %spec.name, "starting analyzer driver");

    // Anything else on stdin is the stop signal; a closed stdin means the
    // supervisor is gone, which counts as stop too.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == "stop" {
                    break;
                }
            }
            stop.store(true, Ordering::Relaxed);
        });
    }

    let outcome = drive(&spec, config, &stop).await;
    info!(analyzer = %spec.name, "analyzer driver terminated");
    outcome
}

/// Write one control message to the supervisor.
fn signal(message: DriverMessage) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{}", message.as_str());
    let _ = stdout.flush();
}

async fn drive(
    spec: &AnalyzerSpec,
    config: &RuntimeConfig,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let mut reader = StreamReader::new(config.source.reader_config());
    if let Err(e) = reader.open(&spec.source.url).await {
        error!(url = %spec.source.url, "failed to open source: {e}");
        signal(DriverMessage::SourceDown);
        return Ok(());
    }
    let video_info = match reader.video_info() {
        Some(info) => info,
        None => {
            signal(DriverMessage::InternalError);
            reader.release();
            anyhow::bail!("reader opened without video info");
        }
    };

    let (dispatch, mut pipelines, sinks) = match build_resources(spec, config, video_info).await {
        Ok(resources) => resources,
        Err(e) => {
            error!("driver setup failed: {e}");
            signal(DriverMessage::InternalError);
            reader.release();
            return Err(e);
        }
    };

    signal(DriverMessage::Ready);

    let outcome = analysis_loop(
        spec,
        config,
        stop,
        &mut reader,
        &dispatch,
        &mut pipelines,
        &sinks,
    )
    .await;

    match &outcome {
        LoopOutcome::SourceDown => signal(DriverMessage::SourceDown),
        LoopOutcome::Internal(_) => signal(DriverMessage::InternalError),
        LoopOutcome::Stopped | LoopOutcome::EndOfVideo => {}
    }

    // Cleanup runs on every exit path; any open clip is finalised here.
    reader.release();
    for pipeline in &mut pipelines {
        pipeline.release().await;
    }
    dispatch.close();

    match outcome {
        LoopOutcome::Internal(e) => Err(e),
        _ => Ok(()),
    }
}

/// Connect sinks, load the model, and build the analyzer's pipelines.
async fn build_resources(
    spec: &AnalyzerSpec,
    config: &RuntimeConfig,
    video_info: VideoInfo,
) -> anyhow::Result<(DetectionDispatch, Vec<Box<dyn AnalysisPipeline>>, EventSinks)> {
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(config.storage.clone()).await?);
    let event_store: Arc<dyn EventStore> =
        Arc::new(PostgresEventStore::new(&config.database).await?);
    let notifier: Arc<dyn Notifier> = Arc::new(NatsNotifier::connect(&config.messaging).await?);
    let sinks = EventSinks::new(
        event_store,
        notifier,
        WorkerPool::new("IO", config.executors.io_slots),
    );

    let labels = Arc::new(load_label_index(&config.detection.labels_path)?);
    let detector: Arc<dyn Detector> = Arc::new(OnnxDetector::from_path(&config.detection.model_path)?);
    let dispatch = DetectionDispatch::new(
        detector,
        WorkerPool::new("GPU", config.detection.gpu_slots),
    );

    let ctx = PipelineContext {
        analyzer_id: spec.id.clone(),
        frame_size: video_info.frame_size(),
        labels,
        clip: config.clips.clip_config(),
        store,
        writer_factory: Arc::new(Mp4WriterFactory),
    };
    let pipelines = build_pipelines(&spec.pipelines, &ctx)?;

    Ok((dispatch, pipelines, sinks))
}

#[allow(clippy::too_many_arguments)]
async fn analysis_loop(
    spec: &AnalyzerSpec,
    config: &RuntimeConfig,
    stop: &AtomicBool,
    reader: &mut StreamReader,
    dispatch: &DetectionDispatch,
    pipelines: &mut [Box<dyn AnalysisPipeline>],
    sinks: &EventSinks,
) -> LoopOutcome {
    loop {
        if stop.load(Ordering::Relaxed) {
            info!(analyzer = %spec.name, "stop requested");
            return LoopOutcome::Stopped;
        }

        let batch = match reader.read(config.source.batch_size).await {
            Ok(batch) => batch,
            Err(StreamError::EndOfVideo) => {
                info!(analyzer = %spec.name, "source drained");
                return LoopOutcome::EndOfVideo;
            }
            Err(e @ StreamError::Connection(_)) => {
                error!(analyzer = %spec.name, "source connection failed: {e}");
                return LoopOutcome::SourceDown;
            }
            Err(e) => return LoopOutcome::Internal(e.into()),
        };

        let motion = detect_motion(&batch, config.motion.sensitivity);
        let detections = match dispatch.detect(&motion.frames).await {
            Ok(detections) => detections,
            Err(e) => return LoopOutcome::Internal(e.into()),
        };

        for pipeline in pipelines.iter_mut() {
            for event in pipeline.step(&batch, &motion, &detections).await {
                sinks.publish_alert(&spec.id, &event);
            }
        }
    }
}
