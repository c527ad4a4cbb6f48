//! Driver process control.
//!
//! Every started analyzer runs as a child process of the same executable
//! (`analyticsd driver`) so a native decoder fault can only take down its
//! own analyzer. The control channel is line-oriented: the parent writes the
//! analyzer spec as the first stdin line and later the single word `stop`;
//! the child writes `ready`, `source_down` or `internal_error` to stdout.
//! Driver logs go to stderr, which the child inherits.

use crate::analyzer::AnalyzerSpec;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Grace period between `stop` and force-kill.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages a driver sends to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMessage {
    Ready,
    SourceDown,
    InternalError,
}

impl DriverMessage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DriverMessage::Ready => "ready",
            DriverMessage::SourceDown => "source_down",
            DriverMessage::InternalError => "internal_error",
        }
    }
}

impl FromStr for DriverMessage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ready" => Ok(DriverMessage::Ready),
            "source_down" => Ok(DriverMessage::SourceDown),
            "internal_error" => Ok(DriverMessage::InternalError),
            _ => Err(()),
        }
    }
}

/// Supervisor-side handle on one driver.
#[async_trait::async_trait]
pub trait DriverControl: Send {
    /// Next pending message from the driver, if any. Non-blocking.
    fn poll(&mut self) -> Option<DriverMessage>;

    /// Whether the driver has exited.
    fn is_finished(&mut self) -> bool;

    /// Ask the driver to stop at its next loop iteration.
    async fn send_stop(&mut self);

    /// Wait for the driver to exit; force-terminate after the grace period.
    async fn terminate(&mut self);
}

/// Spawns drivers. A trait so the status machine is testable with scripted
/// in-memory drivers.
#[async_trait::async_trait]
pub trait DriverSpawner: Send + Sync {
    async fn spawn(&self, spec: &AnalyzerSpec) -> std::io::Result<Box<dyn DriverControl>>;
}

/// Spawner that re-execs the current binary in driver mode.
pub struct ProcessDriverSpawner {
    config_path: PathBuf,
}

impl ProcessDriverSpawner {
    #[must_use]
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

#[async_trait::async_trait]
impl DriverSpawner for ProcessDriverSpawner {
    async fn spawn(&self, spec: &AnalyzerSpec) -> std::io::Result<Box<dyn DriverControl>> {
        let exe = std::env::current_exe()?;
        let mut child = tokio::process::Command::new(exe)
            .arg("--config")
            .arg(&self.config_path)
            .arg("driver")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("driver stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("driver stdout not piped"))?;

        // First stdin line carries the analyzer spec.
        let spec_line = serde_json::to_string(spec).map_err(std::io::Error::other)?;
        stdin.write_all(spec_line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        // Pump driver messages into a channel the supervisor can poll.
        let (tx, rx) = mpsc::unbounded_channel();
        let analyzer_id = spec.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.parse::<DriverMessage>() {
                    Ok(message) => {
                        debug!(analyzer = %analyzer_id, ?message, "driver message");
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(()) => warn!(analyzer = %analyzer_id, line, "unexpected driver output"),
                }
            }
        });

        Ok(Box::new(ProcessDriver {
            child,
            stdin: Some(stdin),
            messages: rx,
        }))
    }
}

/// A running driver child process.
pub struct ProcessDriver {
    child: Child,
    stdin: Option<ChildStdin>,
    messages: mpsc::UnboundedReceiver<DriverMessage>,
}

#[async_trait::async_trait]
impl DriverControl for ProcessDriver {
    fn poll(&mut self) -> Option<DriverMessage> {
        self.messages.try_recv().ok()
    }

    fn is_finished(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                error!("driver wait failed: {e}");
                true
            }
        }
    }

    async fn send_stop(&mut self) {
        if let Some(stdin) = self.stdin.as_mut() {
            if stdin.write_all(b"stop\n").await.is_err() || stdin.flush().await.is_err() {
                // Driver already gone; terminate() will reap it.
                self.stdin = None;
            }
        }
    }

    async fn terminate(&mut self) {
        match tokio::time::timeout(TERMINATE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "driver exited"),
            Ok(Err(e)) => error!("driver wait failed: {e}"),
            Err(_) => {
                warn!("driver did not stop in time, killing it");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        self.stdin = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        for message in [
            DriverMessage::Ready,
            DriverMessage::SourceDown,
            DriverMessage::InternalError,
        ] {
            assert_eq!(message.as_str().parse::<DriverMessage>().unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_message_is_rejected() {
        assert!("warming up".parse::<DriverMessage>().is_err());
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        assert_eq!(
            " ready\n".parse::<DriverMessage>().unwrap(),
            DriverMessage::Ready
        );
    }
}
