//! Control-plane integration tests: RPC dispatch against the analyzer
//! status machine, with scripted in-memory drivers standing in for the
//! per-analyzer processes.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use video_analytics_supervisor::api::handle_message;
use video_analytics_supervisor::process::{DriverControl, DriverMessage, DriverSpawner};
use video_analytics_supervisor::{AnalyzerManager, AnalyzerSpec};

struct ScriptedDriver {
    messages: VecDeque<DriverMessage>,
}

#[async_trait::async_trait]
impl DriverControl for ScriptedDriver {
    fn poll(&mut self) -> Option<DriverMessage> {
        self.messages.pop_front()
    }

    fn is_finished(&mut self) -> bool {
        false
    }

    async fn send_stop(&mut self) {}

    async fn terminate(&mut self) {}
}

/// Spawner handing out scripted drivers, one message list per spawn.
#[derive(Default)]
struct ScriptedSpawner {
    scripts: Mutex<VecDeque<Vec<DriverMessage>>>,
    spawned: AtomicUsize,
}

impl ScriptedSpawner {
    fn push(&self, script: Vec<DriverMessage>) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

#[async_trait::async_trait]
impl DriverSpawner for ScriptedSpawner {
    async fn spawn(&self, _spec: &AnalyzerSpec) -> std::io::Result<Box<dyn DriverControl>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedDriver {
            messages: script.into(),
        }))
    }
}

fn create_request(id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "command": "CREATE",
        "params": {
            "id": id,
            "name": "lobby",
            "source": { "url": "rtsp://10.0.0.9/stream1" },
            "pipelines": [{
                "type": "IntrusionDetection",
                "params": {
                    "roi": [{"x": 0.0, "y": 0.0}, {"x": 1.0, "y": 1.0}, {"x": 0.0, "y": 1.0}],
                    "triggers": ["person"]
                }
            }]
        }
    }))
    .unwrap()
}

fn command(cmd: &str, params: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({"command": cmd, "params": params})).unwrap()
}

#[tokio::test]
async fn test_source_down_recovery_over_rpc() {
    let spawner = Arc::new(ScriptedSpawner::default());
    // First driver comes up, then loses its source; the restart is healthy.
    spawner.push(vec![DriverMessage::Ready, DriverMessage::SourceDown]);
    spawner.push(vec![DriverMessage::Ready]);
    let mut manager = AnalyzerManager::new(Arc::clone(&spawner));

    let response = handle_message(&mut manager, &create_request("lobby-1")).await;
    assert_eq!(response["result"], "success");

    manager.tick().await;
    let read = command("READ", json!("lobby-1"));
    assert_eq!(handle_message(&mut manager, &read).await["result"], "running");

    manager.tick().await;
    assert_eq!(
        handle_message(&mut manager, &read).await["result"],
        "source_down"
    );

    // Auto-restart on the next two ticks brings it back up.
    manager.tick().await;
    manager.tick().await;
    assert_eq!(handle_message(&mut manager, &read).await["result"], "running");
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_hot_reconfig_rejected_until_stopped() {
    let spawner = Arc::new(ScriptedSpawner::default());
    spawner.push(vec![DriverMessage::Ready]);
    let mut manager = AnalyzerManager::new(Arc::clone(&spawner));

    handle_message(&mut manager, &create_request("lobby-1")).await;
    manager.tick().await;

    let update = command(
        "UPDATE",
        json!({"id": "lobby-1", "params": {"name": "atrium"}}),
    );
    let response = handle_message(&mut manager, &update).await;
    assert_eq!(
        response["error"]["message"],
        "Hot re-configuring analyzer is not allowed, please stop analyzer first before updating it."
    );
    assert_eq!(manager.spec("lobby-1").unwrap().name, "lobby");

    let stop = command("STOP", json!("lobby-1"));
    assert_eq!(handle_message(&mut manager, &stop).await["result"], "success");
    assert_eq!(
        handle_message(&mut manager, &update).await["result"],
        "success"
    );
    assert_eq!(manager.spec("lobby-1").unwrap().name, "atrium");
}

#[tokio::test]
async fn test_delete_while_running_removes_analyzer() {
    let spawner = Arc::new(ScriptedSpawner::default());
    spawner.push(vec![DriverMessage::Ready]);
    let mut manager = AnalyzerManager::new(Arc::clone(&spawner));

    handle_message(&mut manager, &create_request("lobby-1")).await;
    manager.tick().await;

    let delete = command("DELETE", json!("lobby-1"));
    assert_eq!(
        handle_message(&mut manager, &delete).await["result"],
        "success"
    );
    let read = command("READ", json!("lobby-1"));
    assert_eq!(
        handle_message(&mut manager, &read).await["error"]["message"],
        "Analyzer not found: lobby-1"
    );
}
