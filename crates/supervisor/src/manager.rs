//! Analyzer registry and control-plane operations.

use crate::analyzer::{Analyzer, AnalyzerSpec, AnalyzerStatus, SourceSpec};
use crate::process::DriverSpawner;
use crate::SupervisorError;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use video_analytics_pipeline::PipelineSpec;

/// CREATE parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateParams {
    pub id: String,
    pub name: String,
    pub source: SourceSpec,
    pub pipelines: Vec<PipelineSpec>,
}

/// UPDATE parameters; absent fields are left unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateParams {
    pub name: Option<String>,
    pub source: Option<SourceSpec>,
    pub pipelines: Option<Vec<PipelineSpec>>,
}

/// Owns every analyzer record.
///
/// All mutation happens on the supervisor's event loop: RPC dispatch and the
/// 1 Hz tick are multiplexed onto the same task, so the map needs no lock.
pub struct AnalyzerManager {
    analyzers: HashMap<String, Analyzer>,
    spawner: Arc<dyn DriverSpawner>,
}

impl AnalyzerManager {
    #[must_use]
    pub fn new(spawner: Arc<dyn DriverSpawner>) -> Self {
        Self {
            analyzers: HashMap::new(),
            spawner,
        }
    }

    fn validate_pipelines(pipelines: &[PipelineSpec]) -> Result<(), SupervisorError> {
        for spec in pipelines {
            match spec {
                PipelineSpec::IntrusionDetection(params) => params.validate()?,
            }
        }
        Ok(())
    }

    /// Register a new analyzer and start it.
    pub async fn create(&mut self, params: CreateParams) -> Result<(), SupervisorError> {
        info!(id = %params.id, name = %params.name, "creating analyzer");
        if self.analyzers.contains_key(&params.id) {
            return Err(SupervisorError::InvalidRequest(format!(
                "analyzer '{}' already exists",
                params.id
            )));
        }
        Self::validate_pipelines(&params.pipelines)?;

        let spec = AnalyzerSpec {
            id: params.id.clone(),
            name: params.name,
            source: params.source,
            pipelines: params.pipelines,
        };
        let mut analyzer = Analyzer::new(spec);
        analyzer.start(self.spawner.as_ref()).await?;
        self.analyzers.insert(params.id, analyzer);
        Ok(())
    }

    /// Status of one analyzer.
    pub fn read(&self, id: &str) -> Result<AnalyzerStatus, SupervisorError> {
        self.analyzers
            .get(id)
            .map(Analyzer::status)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// Status of several analyzers, keyed by id.
    pub fn read_many(&self, ids: &[String]) -> Result<HashMap<String, AnalyzerStatus>, SupervisorError> {
        ids.iter()
            .map(|id| Ok((id.clone(), self.read(id)?)))
            .collect()
    }

    /// Reconfigure a stopped analyzer.
    pub fn update(&mut self, id: &str, params: UpdateParams) -> Result<(), SupervisorError> {
        if let Some(pipelines) = &params.pipelines {
            Self::validate_pipelines(pipelines)?;
        }
        let analyzer = self
            .analyzers
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        info!(id, "updating analyzer");
        if let Some(name) = params.name {
            analyzer.set_name(name)?;
        }
        if let Some(source) = params.source {
            analyzer.set_source(source)?;
        }
        if let Some(pipelines) = params.pipelines {
            analyzer.set_pipelines(pipelines)?;
        }
        Ok(())
    }

    /// Stop and unregister one analyzer.
    pub async fn delete(&mut self, id: &str) -> Result<(), SupervisorError> {
        let mut analyzer = self
            .analyzers
            .remove(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        info!(id, "deleting analyzer");
        analyzer.stop().await;
        Ok(())
    }

    /// Start an analyzer if it is not already starting or running.
    pub async fn start(&mut self, id: &str) -> Result<(), SupervisorError> {
        let spawner = Arc::clone(&self.spawner);
        let analyzer = self
            .analyzers
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        analyzer.start(spawner.as_ref()).await
    }

    /// Stop an analyzer.
    pub async fn stop(&mut self, id: &str) -> Result<(), SupervisorError> {
        let analyzer = self
            .analyzers
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        analyzer.stop().await;
        Ok(())
    }

    /// One supervision tick over every analyzer.
    pub async fn tick(&mut self) {
        let spawner = Arc::clone(&self.spawner);
        for analyzer in self.analyzers.values_mut() {
            analyzer.refresh(spawner.as_ref()).await;
        }
    }

    /// Stop every analyzer; used at shutdown.
    pub async fn shutdown(&mut self) {
        for analyzer in self.analyzers.values_mut() {
            analyzer.stop().await;
        }
    }

    /// Spec accessor for tests and introspection.
    #[must_use]
    pub fn spec(&self, id: &str) -> Option<&AnalyzerSpec> {
        self.analyzers.get(id).map(Analyzer::spec)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::process::{DriverControl, DriverMessage};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted driver: hands out queued messages, records stop/terminate.
    pub struct FakeDriver {
        pub messages: Arc<Mutex<VecDeque<DriverMessage>>>,
        pub stopped: Arc<AtomicUsize>,
        pub terminated: Arc<AtomicUsize>,
        pub finished: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl DriverControl for FakeDriver {
        fn poll(&mut self) -> Option<DriverMessage> {
            self.messages.lock().unwrap().pop_front()
        }

        fn is_finished(&mut self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }

        async fn send_stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        async fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Spawner producing scripted drivers and counting spawns.
    #[derive(Default)]
    pub struct FakeSpawner {
        pub spawned: AtomicUsize,
        pub script: Mutex<VecDeque<Vec<DriverMessage>>>,
        pub stopped: Arc<AtomicUsize>,
        pub terminated: Arc<AtomicUsize>,
        pub finished: Arc<std::sync::atomic::AtomicBool>,
    }

    impl FakeSpawner {
        /// Queue the message script for the next spawned driver.
        pub fn push_script(&self, messages: Vec<DriverMessage>) {
            self.script.lock().unwrap().push_back(messages);
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl DriverSpawner for FakeSpawner {
        async fn spawn(&self, _spec: &AnalyzerSpec) -> std::io::Result<Box<dyn DriverControl>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(FakeDriver {
                messages: Arc::new(Mutex::new(script.into())),
                stopped: Arc::clone(&self.stopped),
                terminated: Arc::clone(&self.terminated),
                finished: Arc::clone(&self.finished),
            }))
        }
    }

    pub fn sample_create(id: &str) -> CreateParams {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": "front door",
            "source": { "url": "rtsp://10.0.0.4/stream1" },
            "pipelines": [{
                "type": "IntrusionDetection",
                "params": {
                    "roi": [{"x": 0.0, "y": 0.0}, {"x": 1.0, "y": 1.0}, {"x": 0.0, "y": 1.0}],
                    "triggers": ["person"]
                }
            }]
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::process::DriverMessage;

    fn manager_with(spawner: Arc<FakeSpawner>) -> AnalyzerManager {
        AnalyzerManager::new(spawner)
    }

    #[tokio::test]
    async fn test_create_starts_driver() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager_with(Arc::clone(&spawner));
        manager.create(sample_create("a1")).await.unwrap();

        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Starting);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager_with(spawner);
        manager.create(sample_create("a1")).await.unwrap();
        assert!(manager.create(sample_create("a1")).await.is_err());
    }

    #[tokio::test]
    async fn test_ready_moves_to_running() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.push_script(vec![DriverMessage::Ready]);
        let mut manager = manager_with(spawner);
        manager.create(sample_create("a1")).await.unwrap();

        manager.tick().await;
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Running);
    }

    #[tokio::test]
    async fn test_starting_timeout_goes_source_down_then_restarts() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager_with(Arc::clone(&spawner));
        manager.create(sample_create("a1")).await.unwrap();

        // 20 silent ticks exhaust the countdown, the 21st flips the status.
        for _ in 0..20 {
            manager.tick().await;
            assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Starting);
        }
        manager.tick().await;
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::SourceDown);

        // Next tick restarts the driver.
        manager.tick().await;
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Starting);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_source_down_recovery_reaches_running() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.push_script(vec![DriverMessage::Ready, DriverMessage::SourceDown]);
        // Second driver (the restart) comes up healthy.
        spawner.push_script(vec![DriverMessage::Ready]);
        let mut manager = manager_with(Arc::clone(&spawner));
        manager.create(sample_create("a1")).await.unwrap();

        manager.tick().await; // ready
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Running);
        manager.tick().await; // source_down
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::SourceDown);
        manager.tick().await; // restart
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Starting);
        manager.tick().await; // ready again
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Running);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_internal_error_stops_without_restart() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.push_script(vec![DriverMessage::Ready, DriverMessage::InternalError]);
        let mut manager = manager_with(Arc::clone(&spawner));
        manager.create(sample_create("a1")).await.unwrap();

        manager.tick().await;
        manager.tick().await;
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Stopped);

        // No restart ever happens for a stopped analyzer.
        for _ in 0..3 {
            manager.tick().await;
        }
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_driver_exit_stops() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.push_script(vec![DriverMessage::Ready]);
        let mut manager = manager_with(Arc::clone(&spawner));
        manager.create(sample_create("a1")).await.unwrap();
        manager.tick().await;
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Running);

        // File source ends: the driver exits without a message.
        spawner
            .finished
            .store(true, std::sync::atomic::Ordering::SeqCst);
        manager.tick().await;
        assert_eq!(manager.read("a1").unwrap(), AnalyzerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_hot_reconfig_is_rejected_and_record_unchanged() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.push_script(vec![DriverMessage::Ready]);
        let mut manager = manager_with(spawner);
        manager.create(sample_create("a1")).await.unwrap();
        manager.tick().await;

        let err = manager
            .update(
                "a1",
                UpdateParams {
                    name: Some("back door".to_string()),
                    source: None,
                    pipelines: None,
                },
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Hot re-configuring analyzer is not allowed, please stop analyzer first before updating it."
        );
        assert_eq!(manager.spec("a1").unwrap().name, "front door");
    }

    #[tokio::test]
    async fn test_update_after_stop_applies() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager_with(spawner);
        manager.create(sample_create("a1")).await.unwrap();
        manager.stop("a1").await.unwrap();

        manager
            .update(
                "a1",
                UpdateParams {
                    name: Some("back door".to_string()),
                    source: Some(SourceSpec {
                        url: "rtsp://10.0.0.5/stream1".to_string(),
                    }),
                    pipelines: None,
                },
            )
            .unwrap();
        let spec = manager.spec("a1").unwrap();
        assert_eq!(spec.name, "back door");
        assert_eq!(spec.source.url, "rtsp://10.0.0.5/stream1");
    }

    #[tokio::test]
    async fn test_delete_stops_driver_and_removes_record() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.push_script(vec![DriverMessage::Ready]);
        let mut manager = manager_with(Arc::clone(&spawner));
        manager.create(sample_create("a1")).await.unwrap();
        manager.tick().await;

        manager.delete("a1").await.unwrap();
        assert!(matches!(
            manager.read("a1"),
            Err(SupervisorError::NotFound(_))
        ));
        assert_eq!(spawner.stopped.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            spawner.terminated.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_read_many() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager_with(spawner);
        manager.create(sample_create("a1")).await.unwrap();
        manager.create(sample_create("a2")).await.unwrap();

        let statuses = manager
            .read_many(&["a1".to_string(), "a2".to_string()])
            .unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["a1"], AnalyzerStatus::Starting);

        assert!(manager.read_many(&["a1".to_string(), "nope".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_unknown_id_errors() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager_with(spawner);
        assert!(manager.read("ghost").is_err());
        assert!(manager.start("ghost").await.is_err());
        assert!(manager.stop("ghost").await.is_err());
        assert!(manager.delete("ghost").await.is_err());
    }
}
