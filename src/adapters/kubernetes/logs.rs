//! Pod log capture and following

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::KubernetesAdapter;
use crate::adapters::docker::Cli;
use crate::command::KubernetesOptions;
use crate::error::{Error, Result};

/// Options for `kubectl logs`.
#[derive(Debug, Clone, Default)]
pub struct K8sLogOptions {
    pub tail: Option<u32>,
    /// Relative duration, e.g. `5m`.
    pub since: Option<String>,
    /// RFC3339 timestamp.
    pub since_time: Option<String>,
    /// Logs of the previous container instance.
    pub previous: bool,
    pub timestamps: bool,
    /// Overrides the target's container field.
    pub container: Option<String>,
}

fn log_args(opts: &KubernetesOptions, options: &K8sLogOptions, follow: bool) -> Vec<String> {
    let mut args = KubernetesAdapter::global_flags(opts);
    args.push("logs".to_string());
    args.push("-n".to_string());
    args.push(opts.namespace.clone());
    if follow {
        args.push("-f".to_string());
    }
    if let Some(tail) = options.tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    if let Some(since) = &options.since {
        args.push("--since".to_string());
        args.push(since.clone());
    }
    if let Some(since_time) = &options.since_time {
        args.push("--since-time".to_string());
        args.push(since_time.clone());
    }
    if options.previous {
        args.push("--previous".to_string());
    }
    if options.timestamps {
        args.push("--timestamps".to_string());
    }
    args.extend(KubernetesAdapter::pod_args(opts));
    if let Some(container) = options.container.as_ref().or(opts.container.as_ref()) {
        args.push("-c".to_string());
        args.push(container.clone());
    }
    args
}

/// One-shot capture of the whole requested window.
pub(crate) async fn fetch(
    cli: &Cli,
    opts: &KubernetesOptions,
    options: &K8sLogOptions,
) -> Result<String> {
    let args = log_args(opts, options, false);
    cli.run_checked(&opts.pod, &args).await
}

/// Handle over a `kubectl logs -f` stream.
///
/// `pause` buffers lines; `resume` flushes the buffer to the callback in
/// order and continues live delivery.
pub struct K8sLogStreamHandle {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    buffer: Arc<parking_lot::Mutex<VecDeque<String>>>,
    callback: Arc<dyn Fn(&str) + Send + Sync>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl K8sLogStreamHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let drained: Vec<String> = self.buffer.lock().drain(..).collect();
        for line in drained {
            (self.callback)(&line);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Drop for K8sLogStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start following logs with a line callback.
pub(crate) async fn stream<F>(
    cli: &Cli,
    opts: &KubernetesOptions,
    options: &K8sLogOptions,
    callback: F,
) -> Result<K8sLogStreamHandle>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let args = log_args(opts, options, true);

    let mut child = tokio::process::Command::new(cli.binary())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AdapterUnavailable(format!("{} binary not found", cli.binary()))
            } else {
                Error::Io(e)
            }
        })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        Error::Connection {
            host: opts.pod.clone(),
            message: "kubectl logs produced no stdout pipe".to_string(),
        }
    })?;

    let cancel = CancellationToken::new();
    let paused = Arc::new(AtomicBool::new(false));
    let buffer: Arc<parking_lot::Mutex<VecDeque<String>>> =
        Arc::new(parking_lot::Mutex::new(VecDeque::new()));
    let callback: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(callback);

    let cancel_task = cancel.clone();
    let paused_task = paused.clone();
    let buffer_task = buffer.clone();
    let callback_task = callback.clone();
    let pod = opts.pod.clone();

    let task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel_task.cancelled() => {
                    let _ = child.start_kill();
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if paused_task.load(Ordering::SeqCst) {
                                buffer_task.lock().push_back(line);
                            } else {
                                callback_task(&line);
                            }
                        }
                        Ok(None) | Err(_) => {
                            debug!(pod = %pod, "log stream ended");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(K8sLogStreamHandle {
        cancel,
        paused,
        buffer,
        callback,
        task: parking_lot::Mutex::new(Some(task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_args_full() {
        let opts = KubernetesOptions::pod("api-0").namespace("prod");
        let options = K8sLogOptions {
            tail: Some(50),
            since: Some("5m".into()),
            previous: true,
            timestamps: true,
            container: Some("sidecar".into()),
            ..Default::default()
        };

        let args = log_args(&opts, &options, true);
        assert_eq!(
            args,
            vec![
                "logs",
                "-n",
                "prod",
                "-f",
                "--tail",
                "50",
                "--since",
                "5m",
                "--previous",
                "--timestamps",
                "api-0",
                "-c",
                "sidecar"
            ]
        );
    }

    #[test]
    fn test_pause_buffers_and_resume_flushes() {
        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let delivered2 = delivered.clone();

        let handle = K8sLogStreamHandle {
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            buffer: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            callback: Arc::new(move |line: &str| delivered2.lock().push(line.to_string())),
            task: parking_lot::Mutex::new(None),
        };

        handle.pause();
        assert!(handle.is_paused());
        handle.buffer.lock().push_back("one".into());
        handle.buffer.lock().push_back("two".into());
        assert!(delivered.lock().is_empty());

        handle.resume();
        assert_eq!(delivered.lock().as_slice(), &["one", "two"]);
        assert!(!handle.is_paused());
    }
}
