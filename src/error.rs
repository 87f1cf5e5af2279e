//! Error taxonomy for the execution engine
//!
//! Every failure an adapter or the engine can surface maps onto one of the
//! variants below. Front ends map [`ErrorKind`] to exit codes; the engine
//! itself only guarantees that the kind is discoverable.

use std::time::Duration;

use thiserror::Error;

use crate::exec::ExecutionResult;

/// Direction of a file transfer, carried by transfer errors and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// Error type covering every failure mode of the engine and its adapters
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed command or identifier (bad container name, conflicting
    /// program/shell_line, zero timeout, duplicate env keys).
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested program does not exist on the target.
    #[error("program not found: {program}")]
    ProgramNotFound { program: String },

    /// A required backend (docker/kubectl binary, SSH transport) is not
    /// installed or not usable.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Transport-level failure to reach a remote target.
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// SSH identity rejected. Never retried.
    #[error("authentication failed for {username}@{host}: {message}")]
    Authentication {
        host: String,
        username: String,
        message: String,
    },

    /// Command exceeded its timeout.
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout {
        command: String,
        timeout: Duration,
        /// Whatever output was captured before the timer fired.
        partial: Option<Box<ExecutionResult>>,
    },

    /// Command was cancelled through its cancellation handle.
    #[error("command cancelled: {command}")]
    Cancelled {
        command: String,
        partial: Option<Box<ExecutionResult>>,
    },

    /// Process exited non-zero or on a signal. Carries the full result.
    #[error("command failed with exit code {}: {}", .0.exit_code, .0.command)]
    CommandFailed(Box<ExecutionResult>),

    /// Output could not be decoded as the requested format. Independent of
    /// the process exit status.
    #[error("failed to decode output as {what}: {message}")]
    Decode {
        what: &'static str,
        message: String,
        raw: bytes::Bytes,
    },

    /// SFTP or cp transfer failure.
    #[error("{direction} {source_path} -> {destination} failed: {message}")]
    Transfer {
        direction: TransferDirection,
        source_path: String,
        destination: String,
        message: String,
    },

    /// Listener bind, channel open, or remote bind failure on an SSH tunnel.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// kubectl port-forward failure.
    #[error("port-forward error: {0}")]
    PortForward(String),

    /// Pool cap hit and the acquire timeout expired.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Engine or adapter already disposed.
    #[error("disposed: {0}")]
    Disposed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    SshKeys(#[from] russh::keys::Error),

    #[error("SFTP error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed set of error kinds, for front-end exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    AdapterUnavailable,
    Connection,
    Authentication,
    Timeout,
    Cancelled,
    CommandFailure,
    Decoder,
    Transfer,
    Tunnel,
    PortForward,
    ResourceExhausted,
    Io,
}

impl Error {
    /// Classify this error into the closed [`ErrorKind`] set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::ProgramNotFound { .. } | Error::AdapterUnavailable(_) => {
                ErrorKind::AdapterUnavailable
            }
            Error::Connection { .. } | Error::Ssh(_) => ErrorKind::Connection,
            Error::Authentication { .. } | Error::SshKeys(_) => ErrorKind::Authentication,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::CommandFailed(_) => ErrorKind::CommandFailure,
            Error::Decode { .. } | Error::Json(_) => ErrorKind::Decoder,
            Error::Transfer { .. } | Error::Sftp(_) => ErrorKind::Transfer,
            Error::Tunnel(_) => ErrorKind::Tunnel,
            Error::PortForward(_) => ErrorKind::PortForward,
            Error::ResourceExhausted(_) | Error::Disposed(_) => ErrorKind::ResourceExhausted,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a retry policy should consider this failure transient.
    ///
    /// Connection and timeout failures are transient; command exits,
    /// validation and authentication failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Io
        )
    }

    /// The partial [`ExecutionResult`] captured before the failure, if any.
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            Error::Timeout { partial, .. } | Error::Cancelled { partial, .. } => partial.as_deref(),
            Error::CommandFailed(result) => Some(result),
            _ => None,
        }
    }

    /// Structural copy for fan-out to single-flight waiters.
    ///
    /// Source errors that are not `Clone` (io, ssh, sftp, json) collapse to
    /// an `Io` wrapper carrying the rendered message; the kind is preserved
    /// for every other variant.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Validation(msg) => Error::Validation(msg.clone()),
            Error::ProgramNotFound { program } => Error::ProgramNotFound {
                program: program.clone(),
            },
            Error::AdapterUnavailable(msg) => Error::AdapterUnavailable(msg.clone()),
            Error::Connection { host, message } => Error::Connection {
                host: host.clone(),
                message: message.clone(),
            },
            Error::Authentication {
                host,
                username,
                message,
            } => Error::Authentication {
                host: host.clone(),
                username: username.clone(),
                message: message.clone(),
            },
            Error::Timeout {
                command,
                timeout,
                partial,
            } => Error::Timeout {
                command: command.clone(),
                timeout: *timeout,
                partial: partial.clone(),
            },
            Error::Cancelled { command, partial } => Error::Cancelled {
                command: command.clone(),
                partial: partial.clone(),
            },
            Error::CommandFailed(result) => Error::CommandFailed(result.clone()),
            Error::Decode { what, message, raw } => Error::Decode {
                what,
                message: message.clone(),
                raw: raw.clone(),
            },
            Error::Transfer {
                direction,
                source_path,
                destination,
                message,
            } => Error::Transfer {
                direction: *direction,
                source_path: source_path.clone(),
                destination: destination.clone(),
                message: message.clone(),
            },
            Error::Tunnel(msg) => Error::Tunnel(msg.clone()),
            Error::PortForward(msg) => Error::PortForward(msg.clone()),
            Error::ResourceExhausted(msg) => Error::ResourceExhausted(msg.clone()),
            Error::Disposed(msg) => Error::Disposed(msg.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Ssh(e) => Error::Connection {
                host: String::new(),
                message: e.to_string(),
            },
            Error::SshKeys(e) => Error::Authentication {
                host: String::new(),
                username: String::new(),
                message: e.to_string(),
            },
            Error::Sftp(e) => Error::Transfer {
                direction: TransferDirection::Upload,
                source_path: String::new(),
                destination: String::new(),
                message: e.to_string(),
            },
            Error::Json(e) => Error::Decode {
                what: "json",
                message: e.to_string(),
                raw: bytes::Bytes::new(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = Error::Validation("bad name".into());
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = Error::Connection {
            host: "h".into(),
            message: "refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err = Error::ProgramNotFound {
            program: "frobnicate".into(),
        };
        assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Connection {
            host: "h".into(),
            message: "reset".into()
        }
        .is_transient());

        assert!(Error::Timeout {
            command: "sleep 10".into(),
            timeout: Duration::from_millis(100),
            partial: None,
        }
        .is_transient());

        assert!(!Error::Authentication {
            host: "h".into(),
            username: "root".into(),
            message: "denied".into()
        }
        .is_transient());

        assert!(!Error::Validation("".into()).is_transient());
    }

    #[test]
    fn test_transfer_direction_display() {
        assert_eq!(TransferDirection::Upload.to_string(), "upload");
        assert_eq!(TransferDirection::Download.to_string(), "download");
    }
}
