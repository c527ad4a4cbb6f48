//! Analyzer supervision.
//!
//! The supervisor owns the analyzer records, runs one isolated driver
//! process per started analyzer, advances each analyzer's status machine on
//! a 1 Hz tick, and exposes the CRUD/start/stop control plane over the
//! message bus. The driver side of this crate is the per-analyzer worker
//! loop that the `analyticsd driver` re-exec runs.

pub mod analyzer;
pub mod api;
pub mod config;
pub mod driver;
pub mod manager;
pub mod process;

pub use analyzer::{Analyzer, AnalyzerSpec, AnalyzerStatus, SourceSpec};
pub use config::RuntimeConfig;
pub use manager::{AnalyzerManager, CreateParams, UpdateParams};

use thiserror::Error;

/// Errors surfaced to control-plane callers.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(
        "Hot re-configuring analyzer is not allowed, please stop analyzer first before updating it."
    )]
    HotReconfiguration,

    #[error("Analyzer not found: {0}")]
    NotFound(String),

    #[error("Invalid request format: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Validation(String),

    #[error("failed to spawn analyzer driver: {0}")]
    Spawn(String),
}

impl From<video_analytics_pipeline::PipelineError> for SupervisorError {
    fn from(err: video_analytics_pipeline::PipelineError) -> Self {
        SupervisorError::Validation(err.to_string())
    }
}
