//! Process-wide runtime configuration.
//!
//! Loaded once at startup from a YAML file (default `config.yml`) into an
//! immutable record passed to constructors. Driver processes load the same
//! file, so supervisor and drivers always agree on tuning and credentials;
//! secrets can be left out of the file and picked up from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use video_analytics_pipeline::ClipConfig;
use video_analytics_sinks::{DatabaseConfig, NatsConfig, S3Config};
use video_analytics_stream::ReaderConfig;

/// Top-level configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub clips: ClipsConfig,

    #[serde(default)]
    pub storage: S3Config,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub messaging: NatsConfig,

    #[serde(default)]
    pub executors: ExecutorConfig,
}

impl RuntimeConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("can't read config {}: {e}", path.display()))?;
        let config = serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok(config)
    }
}

/// Frame-acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Capture ring capacity in frames.
    pub buffer_size: usize,

    /// Frames per `read` batch.
    pub batch_size: usize,

    /// Capture rate.
    pub fps: u32,

    /// Source open timeout in seconds.
    pub open_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            batch_size: 5,
            fps: 15,
            open_timeout_secs: 10,
        }
    }
}

impl SourceConfig {
    #[must_use]
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            buffer_size: self.buffer_size,
            fps: self.fps,
            open_timeout: Duration::from_secs(self.open_timeout_secs),
        }
    }
}

/// Motion filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Sensitivity in `[1, 100]`.
    pub sensitivity: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self { sensitivity: 80 }
    }
}

/// Detection model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// ONNX detection graph.
    pub model_path: PathBuf,

    /// Label index, one `"{id} {label}"` per line.
    pub labels_path: PathBuf,

    /// GPU capability tokens.
    pub gpu_slots: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/object_detection.onnx"),
            labels_path: PathBuf::from("coco.labels"),
            gpu_slots: 1,
        }
    }
}

/// Event-clip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipsConfig {
    pub video_format: String,
    pub fps: u32,
    pub history_seconds: u32,
    pub post_roll_seconds: u32,
    pub staging_dir: PathBuf,
}

impl Default for ClipsConfig {
    fn default() -> Self {
        Self {
            video_format: "mp4".to_string(),
            fps: 15,
            history_seconds: 3,
            post_roll_seconds: 3,
            staging_dir: std::env::temp_dir(),
        }
    }
}

impl ClipsConfig {
    #[must_use]
    pub fn clip_config(&self) -> ClipConfig {
        ClipConfig {
            video_format: self.video_format.clone(),
            fps: self.fps,
            history_seconds: self.history_seconds,
            post_roll_seconds: self.post_roll_seconds,
            staging_dir: self.staging_dir.clone(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// IO capability tokens for sink fan-out.
    pub io_slots: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { io_slots: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.source.batch_size, 5);
        assert_eq!(config.source.buffer_size, 64);
        assert_eq!(config.motion.sensitivity, 80);
        assert_eq!(config.clips.fps, 15);
        assert_eq!(config.executors.io_slots, 1);
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "source:\n  batch_size: 8\nmotion:\n  sensitivity: 55\nstorage:\n  bucket: events\n"
        )
        .unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.source.batch_size, 8);
        // Unset fields keep their defaults.
        assert_eq!(config.source.fps, 15);
        assert_eq!(config.motion.sensitivity, 55);
        assert_eq!(config.storage.bucket, "events");
    }

    #[test]
    fn test_unknown_top_level_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "sources:\n  batch_size: 8\n").unwrap();
        assert!(RuntimeConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(RuntimeConfig::load(Path::new("/nonexistent/config.yml")).is_err());
    }
}
