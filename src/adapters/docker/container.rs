//! Managed container handle
//!
//! Lifecycle operations for one container: power, inspection, logs,
//! file copy, and readiness waits. Obtained from
//! [`DockerAdapter::container`] or [`DockerAdapter::start_container`].
//!
//! [`DockerAdapter::container`]: super::DockerAdapter::container
//! [`DockerAdapter::start_container`]: super::DockerAdapter::start_container

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cli::Cli;
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Options for a one-shot log fetch.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Last N lines only.
    pub tail: Option<u32>,
    /// Relative duration, e.g. `10m`.
    pub since: Option<String>,
    pub until: Option<String>,
    pub timestamps: bool,
}

/// Handle to a following log stream.
pub struct LogStreamHandle {
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LogStreamHandle {
    /// Stop following; idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for LogStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One managed container.
#[derive(Clone)]
pub struct ContainerHandle {
    name: String,
    cli: Cli,
    #[allow(dead_code)]
    bus: Arc<EventBus>,
}

impl ContainerHandle {
    pub(crate) fn new(name: String, cli: Cli, bus: Arc<EventBus>) -> Self {
        Self { name, cli, bus }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ========================================================================
    // Power operations
    // ========================================================================

    pub async fn start(&self) -> Result<()> {
        self.cli
            .run_checked(&self.name, ["start", self.name.as_str()])
            .await?;
        Ok(())
    }

    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        let mut args = vec!["stop".to_string()];
        if let Some(timeout) = timeout {
            args.push("-t".to_string());
            args.push(timeout.as_secs().to_string());
        }
        args.push(self.name.clone());
        self.cli.run_checked(&self.name, &args).await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.cli
            .run_checked(&self.name, ["restart", self.name.as_str()])
            .await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.cli
            .run_checked(&self.name, ["pause", self.name.as_str()])
            .await?;
        Ok(())
    }

    pub async fn unpause(&self) -> Result<()> {
        self.cli
            .run_checked(&self.name, ["unpause", self.name.as_str()])
            .await?;
        Ok(())
    }

    pub async fn kill(&self, signal: Option<&str>) -> Result<()> {
        let mut args = vec!["kill".to_string()];
        if let Some(signal) = signal {
            args.push("-s".to_string());
            args.push(signal.to_string());
        }
        args.push(self.name.clone());
        self.cli.run_checked(&self.name, &args).await?;
        Ok(())
    }

    pub async fn remove(&self, force: bool, volumes: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        if volumes {
            args.push("-v".to_string());
        }
        args.push(self.name.clone());
        self.cli.run_checked(&self.name, &args).await?;
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Full `docker inspect` document.
    pub async fn inspect(&self) -> Result<serde_json::Value> {
        let raw = self
            .cli
            .run_checked(&self.name, ["inspect", self.name.as_str()])
            .await?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)?;
        // Inspect always returns an array; a single name yields one entry.
        parsed
            .as_array()
            .and_then(|list| list.first().cloned())
            .ok_or_else(|| Error::Connection {
                host: self.name.clone(),
                message: "empty inspect response".to_string(),
            })
    }

    pub async fn exists(&self) -> bool {
        self.cli
            .run(["inspect", "--format", "{{.Id}}", self.name.as_str()])
            .await
            .map(|out| out.ok())
            .unwrap_or(false)
    }

    pub async fn is_running(&self) -> Result<bool> {
        let state = self
            .cli
            .run_checked(
                &self.name,
                ["inspect", "--format", "{{.State.Running}}", self.name.as_str()],
            )
            .await?;
        Ok(state == "true")
    }

    /// One-shot stats sample.
    pub async fn stats(&self) -> Result<serde_json::Value> {
        let raw = self
            .cli
            .run_checked(
                &self.name,
                [
                    "stats",
                    "--no-stream",
                    "--format",
                    "{{json .}}",
                    self.name.as_str(),
                ],
            )
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// First IP address the container reports, preferring the default
    /// bridge field and falling back to the first attached network.
    pub async fn get_ip_address(&self) -> Result<String> {
        let inspect = self.inspect().await?;
        let settings = &inspect["NetworkSettings"];

        if let Some(ip) = settings["IPAddress"].as_str() {
            if !ip.is_empty() {
                return Ok(ip.to_string());
            }
        }
        if let Some(networks) = settings["Networks"].as_object() {
            for network in networks.values() {
                if let Some(ip) = network["IPAddress"].as_str() {
                    if !ip.is_empty() {
                        return Ok(ip.to_string());
                    }
                }
            }
        }
        Err(Error::Connection {
            host: self.name.clone(),
            message: "container has no IP address".to_string(),
        })
    }

    /// Snapshot the container into an image.
    pub async fn commit(&self, repo_tag: &str) -> Result<String> {
        self.cli
            .run_checked(&self.name, ["commit", self.name.as_str(), repo_tag])
            .await
    }

    // ========================================================================
    // Logs
    // ========================================================================

    /// Captured logs per the options.
    pub async fn logs(&self, options: &LogOptions) -> Result<String> {
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = options.tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if let Some(since) = &options.since {
            args.push("--since".to_string());
            args.push(since.clone());
        }
        if let Some(until) = &options.until {
            args.push("--until".to_string());
            args.push(until.clone());
        }
        if options.timestamps {
            args.push("--timestamps".to_string());
        }
        args.push(self.name.clone());

        let output = self.cli.run(&args).await?;
        if !output.ok() {
            return Err(Error::Connection {
                host: self.name.clone(),
                message: output.stderr_text().trim().to_string(),
            });
        }
        // Docker interleaves both streams on the CLI; callers get the
        // combined text.
        let mut text = output.stdout_text();
        text.push_str(&output.stderr_text());
        Ok(text)
    }

    /// Follow logs, invoking `callback` once per line in source order.
    pub async fn stream_logs<F>(&self, callback: F) -> Result<LogStreamHandle>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut child = tokio::process::Command::new(self.cli.binary())
            .args(["logs", "-f", self.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::AdapterUnavailable(format!("{} binary not found", self.cli.binary()))
                } else {
                    Error::Io(e)
                }
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cancel = CancellationToken::new();
        let callback = Arc::new(callback);

        let cancel_task = cancel.clone();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let stdout_lines = stdout.map(|s| tokio::io::BufReader::new(s).lines());
            let stderr_lines = stderr.map(|s| tokio::io::BufReader::new(s).lines());

            let stdout_cb = callback.clone();
            let out_task = stdout_lines.map(|mut lines| {
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        stdout_cb(&line);
                    }
                })
            });
            let stderr_cb = callback.clone();
            let err_task = stderr_lines.map(|mut lines| {
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        stderr_cb(&line);
                    }
                })
            });

            tokio::select! {
                _ = cancel_task.cancelled() => {
                    let _ = child.start_kill();
                }
                _ = child.wait() => {
                    debug!(container = %name, "log stream ended");
                }
            }
            if let Some(task) = out_task {
                let _ = task.await;
            }
            if let Some(task) = err_task {
                let _ = task.await;
            }
        });

        Ok(LogStreamHandle {
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    // ========================================================================
    // File copy
    // ========================================================================

    pub async fn cp_to(&self, local: &Path, container_path: &str) -> Result<()> {
        let source = local.to_string_lossy().into_owned();
        let destination = format!("{}:{}", self.name, container_path);
        self.cli
            .run_checked(&self.name, ["cp", source.as_str(), destination.as_str()])
            .await
            .map_err(|e| Error::Transfer {
                direction: crate::error::TransferDirection::Upload,
                source_path: source.clone(),
                destination: destination.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn cp_from(&self, container_path: &str, local: &Path) -> Result<()> {
        let source = format!("{}:{}", self.name, container_path);
        let destination = local.to_string_lossy().into_owned();
        self.cli
            .run_checked(&self.name, ["cp", source.as_str(), destination.as_str()])
            .await
            .map_err(|e| Error::Transfer {
                direction: crate::error::TransferDirection::Download,
                source_path: source.clone(),
                destination: destination.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    // ========================================================================
    // Readiness waits
    // ========================================================================

    /// Wait until a TCP connect to the container's address succeeds.
    pub async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let ip = self.get_ip_address().await?;

        loop {
            match tokio::net::TcpStream::connect((ip.as_str(), port)).await {
                Ok(_) => return Ok(()),
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    return Err(Error::Timeout {
                        command: format!("wait_for_port {}:{} ({})", self.name, port, e),
                        timeout,
                        partial: None,
                    })
                }
            }
        }
    }

    /// Wait until a log line matches `pattern`.
    pub async fn wait_for_log(&self, pattern: &str, timeout: Duration) -> Result<String> {
        let pattern = regex::Regex::new(pattern)
            .map_err(|e| Error::Validation(format!("invalid log pattern: {}", e)))?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = self
            .stream_logs(move |line| {
                let _ = tx.send(line.to_string());
            })
            .await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = rx.recv() => {
                    match line {
                        Some(line) if pattern.is_match(&line) => {
                            stream.stop();
                            return Ok(line);
                        }
                        Some(_) => continue,
                        None => {
                            stream.stop();
                            return Err(Error::Connection {
                                host: self.name.clone(),
                                message: "log stream closed before pattern matched".to_string(),
                            });
                        }
                    }
                }
                _ = &mut deadline => {
                    stream.stop();
                    return Err(Error::Timeout {
                        command: format!("wait_for_log {} {}", self.name, pattern),
                        timeout,
                        partial: None,
                    });
                }
            }
        }
    }

    /// Wait for the health sub-state.
    ///
    /// Containers without a healthcheck count as healthy once they have
    /// been running for `settle`; `unhealthy` fails immediately.
    pub async fn wait_for_healthy(&self, timeout: Duration) -> Result<()> {
        self.wait_for_healthy_with_settle(timeout, Duration::from_secs(1))
            .await
    }

    pub async fn wait_for_healthy_with_settle(
        &self,
        timeout: Duration,
        settle: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut running_since: Option<Instant> = None;

        loop {
            let inspect = self.inspect().await?;
            let state = &inspect["State"];
            let running = state["Running"].as_bool().unwrap_or(false);

            match state["Health"]["Status"].as_str() {
                Some("healthy") => return Ok(()),
                Some("unhealthy") => {
                    return Err(Error::Connection {
                        host: self.name.clone(),
                        message: "container reported unhealthy".to_string(),
                    })
                }
                Some(_) => {} // starting
                None if running => {
                    // No healthcheck: healthy after the settle window.
                    let since = running_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= settle {
                        return Ok(());
                    }
                }
                None => {
                    running_since = None;
                }
            }

            if Instant::now() >= deadline {
                warn!(container = %self.name, "health wait timed out");
                return Err(Error::Timeout {
                    command: format!("wait_for_healthy {}", self.name),
                    timeout,
                    partial: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_options_default() {
        let options = LogOptions::default();
        assert!(options.tail.is_none());
        assert!(!options.timestamps);
    }

    #[tokio::test]
    async fn test_stream_handle_stop_idempotent() {
        let handle = LogStreamHandle {
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        };
        assert!(handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }
}
