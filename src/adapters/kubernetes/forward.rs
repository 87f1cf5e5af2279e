//! kubectl port-forward handles
//!
//! Static forwards use the requested local port; dynamic forwards pass
//! `:remote` and read the OS-assigned port back from kubectl's
//! "Forwarding from" banner.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::KubernetesAdapter;
use crate::adapters::docker::Cli;
use crate::command::KubernetesOptions;
use crate::error::{Error, Result};

/// A live `kubectl port-forward`.
pub struct PortForwardHandle {
    local_port: u16,
    remote_port: u16,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PortForwardHandle {
    /// Local port accepting connections (the OS pick for dynamic
    /// forwards).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop forwarding; subsequent connects to the local port fail.
    /// Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
    }

    /// Resolves when the forward ends, whether by `close` or because the
    /// kubectl process died.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for PortForwardHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spawn the forward and wait for its banner.
pub(crate) async fn open(
    cli: &Cli,
    opts: &KubernetesOptions,
    local_port: u16,
    remote_port: u16,
) -> Result<PortForwardHandle> {
    let mut args = KubernetesAdapter::global_flags(opts);
    args.push("port-forward".to_string());
    args.push("-n".to_string());
    args.push(opts.namespace.clone());
    args.extend(KubernetesAdapter::pod_args(opts));
    // ":remote" lets the OS pick the local side.
    if local_port == 0 {
        args.push(format!(":{}", remote_port));
    } else {
        args.push(format!("{}:{}", local_port, remote_port));
    }

    let mut child = tokio::process::Command::new(cli.binary())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AdapterUnavailable(format!("{} binary not found", cli.binary()))
            } else {
                Error::PortForward(e.to_string())
            }
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::PortForward("port-forward produced no stdout".to_string()))?;
    let stderr = child.stderr.take();

    // kubectl prints one banner per forwarded address, e.g.
    //   Forwarding from 127.0.0.1:45123 -> 80
    let banner = regex::Regex::new(r"Forwarding from [^:]+:(\d+)")
        .expect("valid regex");

    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let bound_port = tokio::time::timeout(Duration::from_secs(15), async {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%line, "port-forward");
            if let Some(captures) = banner.captures(&line) {
                if let Ok(port) = captures[1].parse::<u16>() {
                    return Some(port);
                }
            }
        }
        None
    })
    .await
    .map_err(|_| Error::PortForward("timed out waiting for port-forward to open".to_string()))?;

    let Some(bound_port) = bound_port else {
        let mut message = String::from("port-forward exited before binding");
        if let Some(stderr) = stderr {
            let mut err_lines = tokio::io::BufReader::new(stderr).lines();
            if let Ok(Some(line)) = err_lines.next_line().await {
                message = line;
            }
        }
        let _ = child.start_kill();
        return Err(Error::PortForward(message));
    };

    let open = Arc::new(AtomicBool::new(true));
    let cancel = CancellationToken::new();

    let open_task = open.clone();
    let cancel_task = cancel.clone();
    let pod = opts.pod.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = cancel_task.cancelled() => {
                let _ = child.start_kill();
            }
            status = child.wait() => {
                warn!(pod = %pod, ?status, "port-forward process ended");
                open_task.store(false, Ordering::SeqCst);
                cancel_task.cancel();
            }
        }
        // Keep draining the banner reader so the pipe does not fill.
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    Ok(PortForwardHandle {
        local_port: bound_port,
        remote_port,
        open,
        cancel,
        task: parking_lot::Mutex::new(Some(task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_parse() {
        let banner = regex::Regex::new(r"Forwarding from [^:]+:(\d+)").unwrap();
        let captures = banner
            .captures("Forwarding from 127.0.0.1:45123 -> 80")
            .unwrap();
        assert_eq!(&captures[1], "45123");

        assert!(banner.captures("error: unable to forward").is_none());
    }

    #[test]
    fn test_handle_close_idempotent() {
        let handle = PortForwardHandle {
            local_port: 40000,
            remote_port: 80,
            open: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        };
        assert!(handle.is_open());
        handle.close();
        handle.close();
        assert!(!handle.is_open());
    }
}
