//! Analyzer records and their status machine.

use crate::process::{DriverControl, DriverMessage, DriverSpawner};
use crate::SupervisorError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use video_analytics_pipeline::PipelineSpec;

/// Ticks an analyzer may stay in STARTING before it counts as source-down.
const START_COUNTDOWN_TICKS: u32 = 20;

/// Video source of an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
}

/// The declarative definition of one analyzer, as created over the control
/// plane and as handed to its driver process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSpec {
    pub id: String,
    pub name: String,
    pub source: SourceSpec,
    pub pipelines: Vec<PipelineSpec>,
}

/// Lifecycle status of an analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerStatus {
    Created,
    Starting,
    Running,
    SourceDown,
    Stopped,
}

/// One analyzer: its spec, its status, and (when started) its driver.
///
/// Configuration is immutable while the analyzer is STARTING or RUNNING
/// (the hot-reconfig guard); from SOURCE_DOWN the supervisor restarts the
/// driver on every tick until the analyzer is stopped or deleted.
pub struct Analyzer {
    spec: AnalyzerSpec,
    status: AnalyzerStatus,
    driver: Option<Box<dyn DriverControl>>,
    start_countdown: u32,
}

impl Analyzer {
    #[must_use]
    pub fn new(spec: AnalyzerSpec) -> Self {
        Self {
            spec,
            status: AnalyzerStatus::Created,
            driver: None,
            start_countdown: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    #[must_use]
    pub fn spec(&self) -> &AnalyzerSpec {
        &self.spec
    }

    #[must_use]
    pub fn status(&self) -> AnalyzerStatus {
        self.status
    }

    fn check_hot_reconfiguring(&self) -> Result<(), SupervisorError> {
        if matches!(
            self.status,
            AnalyzerStatus::Running | AnalyzerStatus::Starting
        ) {
            return Err(SupervisorError::HotReconfiguration);
        }
        Ok(())
    }

    pub fn set_name(&mut self, name: String) -> Result<(), SupervisorError> {
        self.check_hot_reconfiguring()?;
        self.spec.name = name;
        Ok(())
    }

    pub fn set_source(&mut self, source: SourceSpec) -> Result<(), SupervisorError> {
        self.check_hot_reconfiguring()?;
        self.spec.source = source;
        Ok(())
    }

    pub fn set_pipelines(&mut self, pipelines: Vec<PipelineSpec>) -> Result<(), SupervisorError> {
        self.check_hot_reconfiguring()?;
        self.spec.pipelines = pipelines;
        Ok(())
    }

    /// Start the driver unless the analyzer is already starting or running.
    pub async fn start(&mut self, spawner: &dyn DriverSpawner) -> Result<(), SupervisorError> {
        if matches!(
            self.status,
            AnalyzerStatus::Running | AnalyzerStatus::Starting
        ) {
            return Ok(());
        }
        info!(analyzer = %self.spec.id, "starting analyzer");
        let driver = spawner
            .spawn(&self.spec)
            .await
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
        self.driver = Some(driver);
        self.status = AnalyzerStatus::Starting;
        self.start_countdown = START_COUNTDOWN_TICKS;
        Ok(())
    }

    /// Stop the driver (if running) and mark the analyzer STOPPED.
    pub async fn stop(&mut self) {
        if matches!(
            self.status,
            AnalyzerStatus::Running | AnalyzerStatus::Starting
        ) {
            self.shutdown_driver().await;
        }
        self.status = AnalyzerStatus::Stopped;
        info!(analyzer = %self.spec.id, "analyzer stopped");
    }

    async fn shutdown_driver(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.send_stop().await;
            driver.terminate().await;
        }
    }

    /// One 1 Hz supervision tick: pull driver messages and advance status.
    pub async fn refresh(&mut self, spawner: &dyn DriverSpawner) {
        match self.status {
            AnalyzerStatus::Starting => self.refresh_starting().await,
            AnalyzerStatus::Running => self.refresh_running().await,
            AnalyzerStatus::SourceDown => {
                // Unbounded restart: retried every tick until stop/delete.
                self.shutdown_driver().await;
                if let Err(e) = self.start(spawner).await {
                    warn!(analyzer = %self.spec.id, "restart failed: {e}");
                }
            }
            AnalyzerStatus::Created | AnalyzerStatus::Stopped => {}
        }
    }

    async fn refresh_starting(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            self.status = AnalyzerStatus::SourceDown;
            return;
        };
        match driver.poll() {
            Some(DriverMessage::Ready) => {
                info!(analyzer = %self.spec.id, "analyzer running");
                self.status = AnalyzerStatus::Running;
            }
            Some(DriverMessage::SourceDown) => {
                warn!(analyzer = %self.spec.id, "source down while starting");
                self.status = AnalyzerStatus::SourceDown;
            }
            Some(DriverMessage::InternalError) => {
                warn!(analyzer = %self.spec.id, "driver failed while starting");
                self.shutdown_driver().await;
                self.status = AnalyzerStatus::Stopped;
            }
            None => {
                if self.start_countdown > 0 {
                    self.start_countdown -= 1;
                } else {
                    warn!(analyzer = %self.spec.id, "driver did not become ready in time");
                    self.status = AnalyzerStatus::SourceDown;
                }
            }
        }
    }

    async fn refresh_running(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            self.status = AnalyzerStatus::SourceDown;
            return;
        };
        match driver.poll() {
            Some(DriverMessage::SourceDown) => {
                warn!(analyzer = %self.spec.id, "source down");
                self.status = AnalyzerStatus::SourceDown;
            }
            Some(DriverMessage::InternalError) => {
                warn!(analyzer = %self.spec.id, "driver reported an internal error");
                self.shutdown_driver().await;
                self.status = AnalyzerStatus::Stopped;
            }
            Some(DriverMessage::Ready) => {}
            None => {
                if driver.is_finished() {
                    // Clean driver exit: a file source reached its end.
                    info!(analyzer = %self.spec.id, "driver finished");
                    self.driver = None;
                    self.status = AnalyzerStatus::Stopped;
                }
            }
        }
    }
}
