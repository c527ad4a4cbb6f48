//! Control-plane RPC over the message bus.
//!
//! Requests arrive on `api.analyzer` as JSON `{command, params}` with the
//! reply subject as correlation; responses are `{result: …}` on success and
//! `{error: {message}}` on failure. The subscription and the 1 Hz
//! supervision tick are multiplexed onto one event loop, so the analyzer
//! map is only ever touched from a single task.

use crate::manager::{AnalyzerManager, CreateParams, UpdateParams};
use crate::SupervisorError;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

/// Subject the control plane listens on.
pub const API_SUBJECT: &str = "api.analyzer";

#[derive(Debug, Deserialize)]
struct ApiRequest {
    command: String,
    #[serde(default)]
    params: Value,
}

/// Run the supervisor event loop until the process is terminated.
pub async fn serve(client: async_nats::Client, mut manager: AnalyzerManager) -> anyhow::Result<()> {
    let mut subscription = client.subscribe(API_SUBJECT).await?;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    info!(subject = API_SUBJECT, "control plane listening");

    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    anyhow::bail!("control-plane subscription closed");
                };
                let response = handle_message(&mut manager, &message.payload).await;
                if let Some(reply) = message.reply {
                    let payload = serde_json::to_vec(&response)?;
                    if let Err(e) = client.publish(reply, payload.into()).await {
                        error!("failed to publish RPC response: {e}");
                    }
                }
            }
            _ = ticker.tick() => {
                manager.tick().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, stopping analyzers");
                manager.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Decode and dispatch one request, shaping the JSON response.
pub async fn handle_message(manager: &mut AnalyzerManager, payload: &[u8]) -> Value {
    let request: ApiRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&SupervisorError::InvalidRequest(e.to_string()));
        }
    };

    match dispatch(manager, &request).await {
        Ok(result) => json!({ "result": result }),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &SupervisorError) -> Value {
    json!({ "error": { "message": error.to_string() } })
}

async fn dispatch(
    manager: &mut AnalyzerManager,
    request: &ApiRequest,
) -> Result<Value, SupervisorError> {
    match request.command.as_str() {
        "CREATE" => {
            let params: CreateParams = decode(&request.params)?;
            manager.create(params).await?;
            Ok(json!("success"))
        }
        "READ" => match &request.params {
            Value::Array(_) => {
                let ids: Vec<String> = decode(&request.params)?;
                let statuses = manager.read_many(&ids)?;
                Ok(serde_json::to_value(statuses)
                    .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?)
            }
            Value::String(id) => {
                let status = manager.read(id)?;
                Ok(serde_json::to_value(status)
                    .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?)
            }
            other => Err(SupervisorError::InvalidRequest(format!(
                "READ expects an id or a list of ids, got {other}"
            ))),
        },
        "UPDATE" => {
            #[derive(Deserialize)]
            struct UpdateRequest {
                id: String,
                params: UpdateParams,
            }
            let update: UpdateRequest = decode(&request.params)?;
            manager.update(&update.id, update.params)?;
            Ok(json!("success"))
        }
        "DELETE" => {
            match &request.params {
                Value::Array(_) => {
                    let ids: Vec<String> = decode(&request.params)?;
                    for id in &ids {
                        manager.delete(id).await?;
                    }
                }
                Value::String(id) => manager.delete(id).await?,
                other => {
                    return Err(SupervisorError::InvalidRequest(format!(
                        "DELETE expects an id or a list of ids, got {other}"
                    )))
                }
            }
            Ok(json!("success"))
        }
        "START" => {
            let id: String = decode(&request.params)?;
            manager.start(&id).await?;
            Ok(json!("success"))
        }
        "STOP" => {
            let id: String = decode(&request.params)?;
            manager.stop(&id).await?;
            Ok(json!("success"))
        }
        other => Err(SupervisorError::InvalidRequest(format!(
            "unknown command '{other}'"
        ))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, SupervisorError> {
    serde_json::from_value(value.clone()).map_err(|e| SupervisorError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::test_support::{sample_create, FakeSpawner};
    use crate::process::DriverMessage;
    use std::sync::Arc;

    fn manager() -> (AnalyzerManager, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner::default());
        (AnalyzerManager::new(Arc::clone(&spawner)), spawner)
    }

    fn create_payload(id: &str) -> Vec<u8> {
        let params = serde_json::json!({
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
        });
        serde_json::to_vec(&serde_json::json!({"command": "CREATE", "params": params})).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (mut manager, _spawner) = manager();
        let response = handle_message(&mut manager, &create_payload("a1")).await;
        assert_eq!(response["result"], "success");

        let read = serde_json::to_vec(&serde_json::json!({
            "command": "READ", "params": "a1"
        }))
        .unwrap();
        let response = handle_message(&mut manager, &read).await;
        assert_eq!(response["result"], "starting");
    }

    #[tokio::test]
    async fn test_read_many_returns_map() {
        let (mut manager, _spawner) = manager();
        handle_message(&mut manager, &create_payload("a1")).await;
        handle_message(&mut manager, &create_payload("a2")).await;

        let read = serde_json::to_vec(&serde_json::json!({
            "command": "READ", "params": ["a1", "a2"]
        }))
        .unwrap();
        let response = handle_message(&mut manager, &read).await;
        assert_eq!(response["result"]["a1"], "starting");
        assert_eq!(response["result"]["a2"], "starting");
    }

    #[tokio::test]
    async fn test_read_unknown_id_is_an_error() {
        let (mut manager, _spawner) = manager();
        let read =
            serde_json::to_vec(&serde_json::json!({"command": "READ", "params": "ghost"})).unwrap();
        let response = handle_message(&mut manager, &read).await;
        assert_eq!(response["error"]["message"], "Analyzer not found: ghost");
    }

    #[tokio::test]
    async fn test_hot_reconfig_error_message() {
        let (mut manager, spawner) = manager();
        spawner.push_script(vec![DriverMessage::Ready]);
        manager.create(sample_create("a1")).await.unwrap();
        manager.tick().await;

        let update = serde_json::to_vec(&serde_json::json!({
            "command": "UPDATE",
            "params": { "id": "a1", "params": { "name": "back door" } }
        }))
        .unwrap();
        let response = handle_message(&mut manager, &update).await;
        assert_eq!(
            response["error"]["message"],
            "Hot re-configuring analyzer is not allowed, please stop analyzer first before updating it."
        );
        assert_eq!(manager.spec("a1").unwrap().name, "front door");
    }

    #[tokio::test]
    async fn test_stop_update_start_cycle() {
        let (mut manager, _spawner) = manager();
        handle_message(&mut manager, &create_payload("a1")).await;

        let stop =
            serde_json::to_vec(&serde_json::json!({"command": "STOP", "params": "a1"})).unwrap();
        assert_eq!(handle_message(&mut manager, &stop).await["result"], "success");

        let update = serde_json::to_vec(&serde_json::json!({
            "command": "UPDATE",
            "params": { "id": "a1", "params": { "name": "back door" } }
        }))
        .unwrap();
        assert_eq!(
            handle_message(&mut manager, &update).await["result"],
            "success"
        );

        let start =
            serde_json::to_vec(&serde_json::json!({"command": "START", "params": "a1"})).unwrap();
        assert_eq!(
            handle_message(&mut manager, &start).await["result"],
            "success"
        );
        assert_eq!(manager.spec("a1").unwrap().name, "back door");
    }

    #[tokio::test]
    async fn test_delete_accepts_id_list() {
        let (mut manager, _spawner) = manager();
        handle_message(&mut manager, &create_payload("a1")).await;
        handle_message(&mut manager, &create_payload("a2")).await;

        let delete = serde_json::to_vec(&serde_json::json!({
            "command": "DELETE", "params": ["a1", "a2"]
        }))
        .unwrap();
        assert_eq!(
            handle_message(&mut manager, &delete).await["result"],
            "success"
        );
        assert!(manager.read("a1").is_err());
        assert!(manager.read("a2").is_err());
    }

    #[tokio::test]
    async fn test_malformed_roi_is_a_validation_error() {
        let (mut manager, _spawner) = manager();
        let payload = serde_json::to_vec(&serde_json::json!({
            "command": "CREATE",
            "params": {
                "id": "a1",
                "name": "front door",
                "source": { "url": "rtsp://10.0.0.4/stream1" },
                "pipelines": [{
                    "type": "IntrusionDetection",
                    "params": { "roi": [{"x": 0.0, "y": 0.0}], "triggers": ["person"] }
                }]
            }
        }))
        .unwrap();
        let response = handle_message(&mut manager, &payload).await;
        let message = response["error"]["message"].as_str().unwrap();
        assert!(message.contains("at least 3 points"));
        assert!(manager.read("a1").is_err());
    }

    #[tokio::test]
    async fn test_unknown_pipeline_type_is_rejected() {
        let (mut manager, _spawner) = manager();
        let payload = serde_json::to_vec(&serde_json::json!({
            "command": "CREATE",
            "params": {
                "id": "a1",
                "name": "front door",
                "source": { "url": "rtsp://10.0.0.4/stream1" },
                "pipelines": [{ "type": "FaceRecognition", "params": {} }]
            }
        }))
        .unwrap();
        let response = handle_message(&mut manager, &payload).await;
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Invalid request format"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (mut manager, _spawner) = manager();
        let payload =
            serde_json::to_vec(&serde_json::json!({"command": "RESTART", "params": "a1"})).unwrap();
        let response = handle_message(&mut manager, &payload).await;
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown command"));
    }

    #[tokio::test]
    async fn test_garbage_payload() {
        let (mut manager, _spawner) = manager();
        let response = handle_message(&mut manager, b"not json").await;
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Invalid request format"));
    }
}
