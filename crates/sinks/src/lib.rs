//! External sinks: object storage, event database, notification bus.
//!
//! Sinks receive finished artefacts — clips, metadata, thumbnails, alert
//! events — and are deliberately decoupled from the analyzer loop: database
//! writes and notifications go through the IO worker pool fire-and-forget,
//! so a slow or failing backend can lose events but never frames.

mod event_store;
mod fanout;
mod notification;
mod object_store;

pub use event_store::{DatabaseConfig, EventStore, PostgresEventStore};
pub use fanout::EventSinks;
pub use notification::{NatsConfig, NatsNotifier, Notifier, NOTIFICATION_SUBJECT};
pub use object_store::{content_type_for_key, ObjectStore, S3Config, S3ObjectStore};

use thiserror::Error;

/// Sink-layer errors.
///
/// These are logged at the point of failure and never propagated into the
/// analyzer loop.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("object storage error: {0}")]
    ObjectStorage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;
