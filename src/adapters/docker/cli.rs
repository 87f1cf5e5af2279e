//! Thin runner for the `docker` binary

use std::process::Stdio;

use tracing::debug;

use crate::error::{Error, Result};

/// Captured output of one CLI invocation.
#[derive(Debug, Clone)]
pub(crate) struct CliOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CliOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Invokes a container CLI (`docker`, or `kubectl` for the k8s adapter).
#[derive(Debug, Clone)]
pub(crate) struct Cli {
    binary: String,
}

impl Cli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run to completion, capturing output. A missing binary surfaces as
    /// `AdapterUnavailable`.
    pub async fn run<I, S>(&self, args: I) -> Result<CliOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        debug!(binary = %self.binary, ?args, "invoking cli");

        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::AdapterUnavailable(format!("{} binary not found", self.binary))
                } else {
                    Error::Io(e)
                }
            })?;

        Ok(CliOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run and require success; returns trimmed stdout.
    pub async fn run_checked<I, S>(&self, subject: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let output = self.run(args).await?;
        if output.ok() {
            Ok(output.stdout_text().trim().to_string())
        } else {
            Err(Error::Connection {
                host: subject.to_string(),
                message: output.stderr_text().trim().to_string(),
            })
        }
    }

    /// Probe for the binary.
    pub async fn available(&self) -> bool {
        matches!(self.run(["version", "--format", "{{.Client.Version}}"]).await, Ok(out) if out.ok())
            || matches!(self.run(["version"]).await, Ok(out) if out.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_adapter_unavailable() {
        let cli = Cli::new("definitely-not-docker-xyz");
        let result = cli.run(["ps"]).await;
        assert!(matches!(result, Err(Error::AdapterUnavailable(_))));
    }

    #[tokio::test]
    async fn test_run_captures_exit_and_output() {
        // Any binary with predictable behavior works for the runner
        // contract; `sh` is as universal as it gets.
        let cli = Cli::new("sh");
        let output = cli.run(["-c", "echo out; echo err >&2; exit 3"]).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert!(!output.ok());
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let cli = Cli::new("sh");
        let result = cli.run_checked("subject", ["-c", "echo broken >&2; exit 1"]).await;
        match result {
            Err(Error::Connection { host, message }) => {
                assert_eq!(host, "subject");
                assert_eq!(message, "broken");
            }
            other => panic!("unexpected: {:?}", other.err().map(|e| e.to_string())),
        }
    }
}
