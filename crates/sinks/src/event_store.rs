//! Event persistence in PostgreSQL.
//!
//! The `events` table holds one row per alert: the analyzer it came from,
//! the event type, the occurrence time, and the full notification message as
//! JSONB.

use crate::{SinkError, SinkResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::NoTls;

/// PostgreSQL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string, e.g.
    /// `host=localhost port=5432 dbname=video_analytics user=postgres`.
    pub uri: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: "host=localhost port=5432 dbname=video_analytics user=postgres".to_string(),
        }
    }
}

/// Persists alert events.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn save_event(
        &self,
        analyzer_id: &str,
        event_type: &str,
        date: DateTime<Utc>,
        message: &serde_json::Value,
    ) -> SinkResult<()>;
}

/// PostgreSQL-backed event store.
pub struct PostgresEventStore {
    client: tokio_postgres::Client,
}

impl PostgresEventStore {
    /// Connect and make sure the schema exists.
    pub async fn new(config: &DatabaseConfig) -> SinkResult<Self> {
        let (client, connection) = tokio_postgres::connect(&config.uri, NoTls)
            .await
            .map_err(|e| SinkError::Database(e.to_string()))?;

        // The connection future drives the socket until the client drops.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres connection error: {e}");
            }
        });

        let store = Self { client };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> SinkResult<()> {
        self.client
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS events (
                    id BIGSERIAL PRIMARY KEY,
                    analyzer_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    date TIMESTAMPTZ NOT NULL,
                    message JSONB NOT NULL
                )
                ",
                &[],
            )
            .await
            .map_err(|e| SinkError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    async fn save_event(
        &self,
        analyzer_id: &str,
        event_type: &str,
        date: DateTime<Utc>,
        message: &serde_json::Value,
    ) -> SinkResult<()> {
        self.client
            .execute(
                "INSERT INTO events (analyzer_id, event_type, date, message)
                 VALUES ($1, $2, $3, $4)",
                &[&analyzer_id, &event_type, &date, message],
            )
            .await
            .map_err(|e| SinkError::Database(e.to_string()))?;
        Ok(())
    }
}
