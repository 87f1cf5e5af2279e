//! Execution results and output decoders

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::AdapterKind;
use crate::error::{Error, Result};

/// Outcome of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured stdout. Empty when the sink was `Ignore` or `Inherit`.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Terminating signal name, if the process died on a signal.
    pub signal: Option<String>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// String rendering of the executed command.
    pub command: String,
    pub adapter: AdapterKind,
    pub host: Option<String>,
    pub container: Option<String>,
    pub pod: Option<String>,
}

impl ExecutionResult {
    /// Skeleton result for adapters to fill in.
    pub fn new(command: impl Into<String>, adapter: AdapterKind) -> Self {
        let now = Utc::now();
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
            signal: None,
            duration: Duration::ZERO,
            started_at: now,
            finished_at: now,
            command: command.into(),
            adapter,
            host: None,
            container: None,
            pod: None,
        }
    }

    /// True when the process exited zero without a signal.
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Which invariant failed, when `!ok()`.
    pub fn cause(&self) -> Option<String> {
        if let Some(signal) = &self.signal {
            Some(format!("signal {}", signal))
        } else if self.exit_code != 0 {
            Some(format!("exit code {}", self.exit_code))
        } else {
            None
        }
    }

    /// Lossy stdout text for display.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Lossy stderr text for display.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    // ========================================================================
    // Decoders
    // ========================================================================

    /// Strict UTF-8 decode of stdout.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.stdout.clone()).map_err(|e| Error::Decode {
            what: "utf-8 text",
            message: e.to_string(),
            raw: Bytes::from(self.stdout.clone()),
        })
    }

    /// Parse stdout as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.stdout).map_err(|e| Error::Decode {
            what: "json",
            message: e.to_string(),
            raw: Bytes::from(self.stdout.clone()),
        })
    }

    /// Stdout split into lines, with the trailing empty line suppressed.
    pub fn lines(&self) -> Result<Vec<String>> {
        let text = self.text()?;
        Ok(split_lines(&text))
    }

    /// Raw stdout bytes.
    pub fn bytes(&self) -> Bytes {
        Bytes::from(self.stdout.clone())
    }
}

/// Split text on `\n`, dropping a `\r` before each break and suppressing
/// the empty segment a trailing newline would produce.
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_stdout(stdout: &[u8]) -> ExecutionResult {
        let mut result = ExecutionResult::new("test", AdapterKind::Local);
        result.stdout = stdout.to_vec();
        result
    }

    #[test]
    fn test_ok_and_cause() {
        let mut result = ExecutionResult::new("true", AdapterKind::Local);
        assert!(result.ok());
        assert_eq!(result.cause(), None);

        result.exit_code = 3;
        assert!(!result.ok());
        assert_eq!(result.cause(), Some("exit code 3".to_string()));

        result.exit_code = 0;
        result.signal = Some("TERM".to_string());
        assert!(!result.ok());
        assert_eq!(result.cause(), Some("signal TERM".to_string()));
    }

    #[test]
    fn test_bytes_round_trip() {
        let payload = b"\x00\x01\xffbinary";
        let result = result_with_stdout(payload);
        assert_eq!(result.bytes().as_ref(), payload);
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let result = result_with_stdout(&[0xff, 0xfe]);
        assert!(matches!(result.text(), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_lines_suppresses_trailing_empty() {
        let result = result_with_stdout(b"a\nb\n");
        assert_eq!(result.lines().unwrap(), vec!["a", "b"]);

        let result = result_with_stdout(b"a\nb");
        assert_eq!(result.lines().unwrap(), vec!["a", "b"]);

        let result = result_with_stdout(b"a\r\nb\r\n");
        assert_eq!(result.lines().unwrap(), vec!["a", "b"]);

        let result = result_with_stdout(b"a\n\nb\n");
        assert_eq!(result.lines().unwrap(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_json_decoder_independent_of_exit() {
        let mut result = result_with_stdout(b"{\"n\": 4}");
        result.exit_code = 1;

        let value: serde_json::Value = result.json().unwrap();
        assert_eq!(value["n"], 4);

        let mut bad = result_with_stdout(b"not json");
        bad.exit_code = 0;
        assert!(matches!(
            bad.json::<serde_json::Value>(),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut result = ExecutionResult::new("printf hi", AdapterKind::Ssh);
        result.stdout = b"hi".to_vec();
        result.host = Some("db1".into());
        result.duration = Duration::from_millis(12);

        let json = serde_json::to_string(&result).unwrap();
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stdout, b"hi");
        assert_eq!(back.host.as_deref(), Some("db1"));
        assert_eq!(back.duration, Duration::from_millis(12));
    }
}
