//! Alert fan-out to the database and the notification bus.

use crate::{EventStore, Notifier};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{error, info};
use video_analytics_common::{AlertEvent, WorkerPool};

/// Notification category for analyzer alerts.
const CATEGORY: &str = "Analyzer";

/// Fans a finished alert out to the external receivers.
///
/// Each receiver gets its own task on the IO pool; the caller returns
/// immediately. Failures are logged through the completion path and
/// deliberately dropped — event loss is tolerated, stalling the analyzer is
/// not.
#[derive(Clone)]
pub struct EventSinks {
    event_store: Arc<dyn EventStore>,
    notifier: Arc<dyn Notifier>,
    pool: WorkerPool,
}

impl EventSinks {
    #[must_use]
    pub fn new(
        event_store: Arc<dyn EventStore>,
        notifier: Arc<dyn Notifier>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            event_store,
            notifier,
            pool,
        }
    }

    /// Publish an alert event. Never blocks on the backends.
    pub fn publish_alert(&self, analyzer_id: &str, event: &AlertEvent) {
        let date = match DateTime::from_timestamp_millis((event.timestamp * 1000.0) as i64) {
            Some(date) => date,
            None => Utc::now(),
        };
        let message = alert_message(analyzer_id, event, date);
        info!(analyzer_id, event = %event.name, "publishing alert");

        {
            let store = Arc::clone(&self.event_store);
            let pool = self.pool.clone();
            let message = message.clone();
            let analyzer_id = analyzer_id.to_string();
            let event_type = event.name.clone();
            tokio::spawn(async move {
                let outcome = pool
                    .run(store.save_event(&analyzer_id, &event_type, date, &message))
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("failed to save event for {analyzer_id}: {e}"),
                    Err(e) => error!("event store task rejected: {e}"),
                }
            });
        }

        {
            let notifier = Arc::clone(&self.notifier);
            let pool = self.pool.clone();
            let analyzer_id = analyzer_id.to_string();
            tokio::spawn(async move {
                let outcome = pool.run(notifier.push(CATEGORY, &message)).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("failed to push notification for {analyzer_id}: {e}"),
                    Err(e) => error!("notification task rejected: {e}"),
                }
            });
        }
    }
}

/// The notification message body shared by the bus and the database.
fn alert_message(analyzer_id: &str, event: &AlertEvent, date: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "analyzerId": analyzer_id,
        "timestamp": event.timestamp,
        "date": date.to_rfc3339_opts(SecondsFormat::Millis, true),
        "type": event.name,
        "content": {
            "video": event.video_key,
            "metadata": event.metadata_key,
            "thumbnail": event.thumbnail_key,
            "triggered": event.triggered,
        }
    })
}
