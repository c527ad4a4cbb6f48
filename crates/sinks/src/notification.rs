//! Notification publishing over the message bus.

use crate::{SinkError, SinkResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Subject alert notifications are published on.
pub const NOTIFICATION_SUBJECT: &str = "notification";

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server addresses, e.g. `nats://localhost:4222`.
    pub hosts: Vec<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["nats://localhost:4222".to_string()],
        }
    }
}

/// Pushes categorised notification messages to subscribers.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, category: &str, message: &serde_json::Value) -> SinkResult<()>;
}

/// NATS-backed notifier.
pub struct NatsNotifier {
    client: async_nats::Client,
}

impl NatsNotifier {
    pub async fn connect(config: &NatsConfig) -> SinkResult<Self> {
        let client = async_nats::connect(config.hosts.join(","))
            .await
            .map_err(|e| SinkError::Notification(e.to_string()))?;
        info!(hosts = ?config.hosts, "notification bus connected");
        Ok(Self { client })
    }

    /// Wrap an existing connection (the supervisor shares one client between
    /// the API connector and notifications).
    #[must_use]
    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Notifier for NatsNotifier {
    async fn push(&self, category: &str, message: &serde_json::Value) -> SinkResult<()> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "category": category,
            "message": message,
        }))?;
        self.client
            .publish(NOTIFICATION_SUBJECT, payload.into())
            .await
            .map_err(|e| SinkError::Notification(e.to_string()))?;
        Ok(())
    }
}
