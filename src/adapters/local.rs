//! Local child-process adapter
//!
//! Baseline semantics for every other backend: spawn via the host OS,
//! honor cwd/env/shell/stdin, capture output, and escalate from the
//! timeout signal to SIGKILL after the grace period.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tracing::{debug, warn};

use super::{Adapter, Capabilities};
use crate::command::{AdapterKind, Command, OutputSink, StdinSource};
use crate::error::{Error, Result};
use crate::exec::stream::{sleep_until_deadline, OutputCollector, ProgressTracker};
use crate::exec::ExecutionResult;

/// Resolve a POSIX signal name (`TERM` or `SIGTERM`) for delivery.
#[cfg(unix)]
pub(crate) fn parse_signal(name: &str) -> Option<nix::sys::signal::Signal> {
    use std::str::FromStr;

    let normalized = if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{}", name)
    };
    nix::sys::signal::Signal::from_str(&normalized).ok()
}

/// Name for a raw signal number, without the `SIG` prefix.
#[cfg(unix)]
pub(crate) fn signal_name(signum: i32) -> String {
    nix::sys::signal::Signal::try_from(signum)
        .map(|s| s.as_str().trim_start_matches("SIG").to_string())
        .unwrap_or_else(|_| signum.to_string())
}

/// Why the wait loop stopped the child early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    TimedOut,
    Cancelled,
}

/// Adapter that spawns commands on the local host.
#[derive(Default)]
pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Deliver a named signal to the child, by pid on Unix.
    fn deliver_signal(child: &mut Child, name: &str) {
        #[cfg(unix)]
        {
            if let (Some(pid), Some(signal)) = (child.id(), parse_signal(name)) {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(e) = nix::sys::signal::kill(pid, signal) {
                    warn!(%pid, signal = name, error = %e, "signal delivery failed");
                }
                return;
            }
        }
        // Unknown signal or non-Unix platform: hard kill is the only lever.
        let _ = child.start_kill();
    }

    fn force_kill(child: &mut Child) {
        let _ = child.start_kill();
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tty: false,
            transfer: false,
            tunnel: false,
            port_forward: false,
            health: false,
        }
    }

    async fn execute(&self, cmd: Command) -> Result<ExecutionResult> {
        cmd.validate()?;
        let argv = cmd.argv()?;
        let display_str = cmd.display_string();

        let mut pc = tokio::process::Command::new(&argv[0]);
        pc.args(&argv[1..]);
        if let Some(cwd) = &cmd.cwd {
            pc.current_dir(cwd);
        }
        if let Some(env) = &cmd.env {
            // An explicit env replaces the ambient one entirely; context
            // additions still apply underneath it.
            pc.env_clear();
            pc.envs(&cmd.env_extra);
            pc.envs(env);
        } else if !cmd.env_extra.is_empty() {
            pc.envs(&cmd.env_extra);
        }

        pc.stdin(match &cmd.stdin {
            StdinSource::Null => Stdio::null(),
            StdinSource::Inherit => Stdio::inherit(),
            StdinSource::Bytes(_) | StdinSource::Reader(_) => Stdio::piped(),
        });
        pc.stdout(match &cmd.stdout {
            OutputSink::Inherit => Stdio::inherit(),
            OutputSink::Ignore => Stdio::null(),
            _ => Stdio::piped(),
        });
        pc.stderr(match &cmd.stderr {
            OutputSink::Inherit => Stdio::inherit(),
            OutputSink::Ignore => Stdio::null(),
            _ => Stdio::piped(),
        });
        pc.kill_on_drop(true);

        let started_at = Utc::now();
        let started = Instant::now();

        let mut child = pc.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ProgramNotFound {
                    program: argv[0].clone(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        debug!(command = %display_str, pid = child.id(), "spawned local process");

        // Feed stdin from its configured source, then close it.
        if let Some(mut stdin) = child.stdin.take() {
            let source = cmd.stdin.clone();
            tokio::spawn(async move {
                match source {
                    StdinSource::Bytes(bytes) => {
                        let _ = stdin.write_all(&bytes).await;
                    }
                    StdinSource::Reader(shared) => {
                        let taken = shared.lock().take();
                        if let Some(mut reader) = taken {
                            let _ = tokio::io::copy(&mut reader, &mut stdin).await;
                        }
                    }
                    _ => {}
                }
                let _ = stdin.shutdown().await;
            });
        }

        // Output drains run concurrently with the wait loop so sinks see
        // data while the command is still in flight.
        let progress = std::sync::Arc::new(parking_lot::Mutex::new(ProgressTracker::for_config(
            cmd.progress.as_ref(),
        )));

        let stdout_task = child.stdout.take().map(|stream| {
            let sink = cmd.stdout.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut collector = OutputCollector::new(&sink);
                let mut chunk = [0u8; 8192];
                use tokio::io::AsyncReadExt;
                let mut stream = stream;
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = collector.push(&chunk[..n]).await;
                            if let Some(tracker) = progress.lock().as_mut() {
                                tracker.record_stdout(&chunk[..n]);
                            }
                        }
                    }
                }
                collector.finish().await
            })
        });

        let stderr_task = child.stderr.take().map(|stream| {
            let sink = cmd.stderr.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut collector = OutputCollector::new(&sink);
                let mut chunk = [0u8; 8192];
                use tokio::io::AsyncReadExt;
                let mut stream = stream;
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = collector.push(&chunk[..n]).await;
                            if let Some(tracker) = progress.lock().as_mut() {
                                tracker.record_stderr(&chunk[..n]);
                            }
                        }
                    }
                }
                collector.finish().await
            })
        });

        let cancel = cmd.cancel_token();
        let mut kill_rx = cmd.kill.register();
        let mut deadline = cmd.timeout.map(|t| Instant::now() + t);
        let mut stop_reason: Option<StopReason> = None;
        let mut escalated = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,

                _ = cancel.cancelled(), if stop_reason.is_none() => {
                    stop_reason = Some(StopReason::Cancelled);
                    Self::deliver_signal(&mut child, &cmd.timeout_signal);
                    deadline = Some(Instant::now() + cmd.kill_grace);
                }

                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    if stop_reason.is_none() {
                        stop_reason = Some(StopReason::TimedOut);
                        Self::deliver_signal(&mut child, &cmd.timeout_signal);
                        deadline = Some(Instant::now() + cmd.kill_grace);
                    } else if !escalated {
                        escalated = true;
                        Self::force_kill(&mut child);
                        deadline = None;
                    }
                }

                Some(signal) = kill_rx.recv() => {
                    Self::deliver_signal(&mut child, &signal);
                }
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(tracker) = progress.lock().as_mut() {
            tracker.report();
        }

        let finished_at = Utc::now();

        #[cfg(unix)]
        let (exit_code, signal) = {
            use std::os::unix::process::ExitStatusExt;
            match (status.code(), status.signal()) {
                (Some(code), _) => (code, None),
                (None, Some(signum)) => (128 + signum, Some(signal_name(signum))),
                (None, None) => (-1, None),
            }
        };
        #[cfg(not(unix))]
        let (exit_code, signal) = (status.code().unwrap_or(-1), None::<String>);

        let result = ExecutionResult {
            stdout,
            stderr,
            exit_code,
            signal,
            duration: started.elapsed(),
            started_at,
            finished_at,
            command: display_str.clone(),
            adapter: AdapterKind::Local,
            host: None,
            container: None,
            pod: None,
        };

        match stop_reason {
            Some(StopReason::TimedOut) => Err(Error::Timeout {
                command: display_str,
                timeout: cmd.timeout.unwrap_or_default(),
                partial: Some(Box::new(result)),
            }),
            Some(StopReason::Cancelled) => Err(Error::Cancelled {
                command: display_str,
                partial: Some(Box::new(result)),
            }),
            None => Ok(result),
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[test]
    fn test_parse_signal_names() {
        use nix::sys::signal::Signal;
        assert_eq!(parse_signal("TERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("SIGKILL"), Some(Signal::SIGKILL));
        assert_eq!(parse_signal("INT"), Some(Signal::SIGINT));
        assert_eq!(parse_signal("NOSUCH"), None);
    }

    #[tokio::test]
    async fn test_local_echo() {
        let adapter = LocalAdapter::new();
        let cmd = Command::new("printf").args(["%s", "hi"]).target(crate::command::Target::Local);

        let result = adapter.execute(cmd).await.unwrap();
        assert!(result.ok());
        assert_eq!(result.stdout, b"hi");
        assert!(result.stderr.is_empty());
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_shell_line() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("echo $((2 + 3))");

        let result = adapter.execute(cmd).await.unwrap();
        assert_eq!(result.stdout, b"5\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_ok_at_adapter_level() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("exit 7");

        let result = adapter.execute(cmd).await.unwrap();
        assert!(!result.ok());
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.cause(), Some("exit code 7".to_string()));
    }

    #[tokio::test]
    async fn test_program_not_found() {
        let adapter = LocalAdapter::new();
        let cmd = Command::new("definitely-not-a-real-program-xyz");

        let result = adapter.execute(cmd).await;
        assert!(matches!(result, Err(Error::ProgramNotFound { .. })));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("sleep 10")
            .timeout(Duration::from_millis(100))
            .timeout_signal("TERM");

        let started = Instant::now();
        let result = adapter.execute(cmd).await;
        let elapsed = started.elapsed();

        match result {
            Err(Error::Timeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other.map(|r| r.exit_code)),
        }
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cancellation_settles_quickly() {
        use tokio_util::sync::CancellationToken;

        let adapter = LocalAdapter::new();
        let token = CancellationToken::new();
        let cmd = Command::shell("sleep 10").cancel(token.clone());

        let handle = tokio::spawn(async move { adapter.execute(cmd).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_stdin_bytes() {
        let adapter = LocalAdapter::new();
        let cmd = Command::new("cat").stdin_bytes(&b"fed via stdin"[..]);

        let result = adapter.execute(cmd).await.unwrap();
        assert_eq!(result.stdout, b"fed via stdin");
    }

    #[tokio::test]
    async fn test_empty_env_not_inherited() {
        std::env::set_var("UXEC_TEST_MARKER", "leaked");

        let adapter = LocalAdapter::new();
        let cmd = Command::new("env").env_clear();

        let result = adapter.execute(cmd).await.unwrap();
        let text = result.stdout_text();
        assert!(
            !text.contains("UXEC_TEST_MARKER"),
            "ambient env leaked: {}",
            text
        );
    }

    #[tokio::test]
    async fn test_explicit_env_only() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("echo \"$GREETING\"")
            .envs([("GREETING", "hello")])
            .unwrap();

        let result = adapter.execute(cmd).await.unwrap();
        assert_eq!(result.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn test_cwd_honored() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new();
        let cmd = Command::new("pwd").cwd(dir.path());

        let result = adapter.execute(cmd).await.unwrap();
        let printed = result.stdout_text();
        let printed = printed.trim_end();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(printed).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_kill_switch_signal() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("sleep 10");
        let kill = cmd.kill.clone();

        let handle = tokio::spawn(async move { adapter.execute(cmd).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill.send("TERM");

        let result = handle.await.unwrap().unwrap();
        assert!(!result.ok());
        // Depending on whether sh execs or forks, the death shows up as
        // the raw signal or as the 128+15 convention.
        assert!(
            result.signal.as_deref() == Some("TERM") || result.exit_code == 143,
            "signal={:?} exit={}",
            result.signal,
            result.exit_code
        );
    }

    #[tokio::test]
    async fn test_stderr_captured_separately() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("echo out; echo err >&2");

        let result = adapter.execute(cmd).await.unwrap();
        assert_eq!(result.stdout, b"out\n");
        assert_eq!(result.stderr, b"err\n");
    }
}
