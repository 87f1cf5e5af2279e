//! Event catalogue and bus
//!
//! Every component publishes typed events through the [`EventBus`].
//! The payload set is closed; names follow the `group:action` convention
//! and wildcard subscriptions match on that string.

mod bus;

pub use bus::{EventBus, EventFilter, SubscriptionId};

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::AdapterKind;
use crate::error::TransferDirection;

/// Why a cache entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictReason {
    Ttl,
    Capacity,
    Manual,
    Tag,
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictReason::Ttl => write!(f, "ttl"),
            EvictReason::Capacity => write!(f, "capacity"),
            EvictReason::Manual => write!(f, "manual"),
            EvictReason::Tag => write!(f, "tag"),
        }
    }
}

/// Kind of leased temporary resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempKind {
    File,
    Dir,
}

/// Transport type for the reserved connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Ssh,
    Docker,
    Kubernetes,
    Local,
}

/// One event on the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub adapter: AdapterKind,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(adapter: AdapterKind, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            adapter,
            payload,
        }
    }

    /// Canonical `group:action` name.
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

/// Closed set of event payloads.
#[derive(Debug, Clone)]
pub enum EventPayload {
    CommandStart {
        command: String,
        args: Option<Vec<String>>,
        cwd: Option<String>,
        shell: Option<String>,
        env: Option<BTreeMap<String, String>>,
    },
    CommandComplete {
        command: String,
        exit_code: i32,
        stdout: Option<String>,
        stderr: Option<String>,
        duration: Duration,
    },
    CommandError {
        command: String,
        error: String,
        duration: Duration,
    },

    /// Reserved: emitted by transport adapters only, never by local.
    ConnectionOpen {
        connection_type: ConnectionType,
        host: Option<String>,
        port: Option<u16>,
        metadata: Option<serde_json::Value>,
    },
    /// Reserved: emitted by transport adapters only, never by local.
    ConnectionClose {
        connection_type: ConnectionType,
        host: Option<String>,
        port: Option<u16>,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    },

    SshConnect {
        host: String,
        port: Option<u16>,
        username: Option<String>,
    },
    SshDisconnect {
        host: String,
        reason: Option<String>,
    },
    SshExecute {
        host: String,
        command: String,
    },
    SshKeyValidated {
        host: String,
        username: String,
        key_type: String,
    },
    SshPoolMetrics {
        total: usize,
        active: usize,
        idle: usize,
        reuse_count: u64,
        avg_idle_time: Duration,
    },
    SshPoolCleanup {
        cleaned: usize,
        remaining: usize,
        reason: Option<String>,
    },
    SshReconnect {
        host: String,
        attempts: u32,
        success: Option<bool>,
    },
    SshTunnelCreated {
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    SshTunnelClosed {
        local_port: u16,
    },

    DockerRun {
        image: String,
        container: Option<String>,
        command: Option<String>,
    },
    DockerExec {
        container: String,
        command: String,
    },

    K8sExec {
        pod: String,
        namespace: Option<String>,
        container: Option<String>,
        command: String,
    },

    CacheHit {
        key: String,
        ttl: Option<Duration>,
    },
    CacheMiss {
        key: String,
    },
    CacheSet {
        key: String,
        ttl: Option<Duration>,
        size: Option<u64>,
    },
    CacheEvict {
        key: String,
        reason: EvictReason,
    },

    RetryAttempt {
        attempt: u32,
        max_attempts: u32,
        delay: Option<Duration>,
        error: Option<String>,
    },
    RetrySuccess {
        attempt: u32,
        max_attempts: u32,
        total_duration: Duration,
    },
    RetryFailed {
        attempt: u32,
        max_attempts: u32,
        total_duration: Duration,
        last_error: String,
    },

    FileRead {
        path: String,
        size: Option<u64>,
    },
    FileWrite {
        path: String,
        size: Option<u64>,
    },
    FileDelete {
        path: String,
    },

    TransferStart {
        direction: TransferDirection,
        source: String,
        destination: String,
    },
    TransferComplete {
        direction: TransferDirection,
        source: String,
        destination: String,
        bytes_transferred: u64,
        duration: Duration,
    },
    TransferError {
        direction: TransferDirection,
        source: String,
        destination: String,
        error: String,
    },

    TempCreate {
        path: String,
        kind: TempKind,
    },
    TempCleanup {
        path: String,
        kind: TempKind,
    },

    /// A subscriber raised out of its handler; the emitter is shielded and
    /// the failure resurfaces as this event.
    HandlerError {
        event: String,
        error: String,
    },
}

impl EventPayload {
    /// Canonical `group:action` name for pattern matching.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::CommandStart { .. } => "command:start",
            EventPayload::CommandComplete { .. } => "command:complete",
            EventPayload::CommandError { .. } => "command:error",
            EventPayload::ConnectionOpen { .. } => "connection:open",
            EventPayload::ConnectionClose { .. } => "connection:close",
            EventPayload::SshConnect { .. } => "ssh:connect",
            EventPayload::SshDisconnect { .. } => "ssh:disconnect",
            EventPayload::SshExecute { .. } => "ssh:execute",
            EventPayload::SshKeyValidated { .. } => "ssh:key-validated",
            EventPayload::SshPoolMetrics { .. } => "ssh:pool-metrics",
            EventPayload::SshPoolCleanup { .. } => "ssh:pool-cleanup",
            EventPayload::SshReconnect { .. } => "ssh:reconnect",
            EventPayload::SshTunnelCreated { .. } => "ssh:tunnel-created",
            EventPayload::SshTunnelClosed { .. } => "ssh:tunnel-closed",
            EventPayload::DockerRun { .. } => "docker:run",
            EventPayload::DockerExec { .. } => "docker:exec",
            EventPayload::K8sExec { .. } => "k8s:exec",
            EventPayload::CacheHit { .. } => "cache:hit",
            EventPayload::CacheMiss { .. } => "cache:miss",
            EventPayload::CacheSet { .. } => "cache:set",
            EventPayload::CacheEvict { .. } => "cache:evict",
            EventPayload::RetryAttempt { .. } => "retry:attempt",
            EventPayload::RetrySuccess { .. } => "retry:success",
            EventPayload::RetryFailed { .. } => "retry:failed",
            EventPayload::FileRead { .. } => "file:read",
            EventPayload::FileWrite { .. } => "file:write",
            EventPayload::FileDelete { .. } => "file:delete",
            EventPayload::TransferStart { .. } => "transfer:start",
            EventPayload::TransferComplete { .. } => "transfer:complete",
            EventPayload::TransferError { .. } => "transfer:error",
            EventPayload::TempCreate { .. } => "temp:create",
            EventPayload::TempCleanup { .. } => "temp:cleanup",
            EventPayload::HandlerError { .. } => "handler:error",
        }
    }

    /// Host the payload refers to, for filter matching.
    pub fn host(&self) -> Option<&str> {
        match self {
            EventPayload::ConnectionOpen { host, .. }
            | EventPayload::ConnectionClose { host, .. } => host.as_deref(),
            EventPayload::SshConnect { host, .. }
            | EventPayload::SshDisconnect { host, .. }
            | EventPayload::SshExecute { host, .. }
            | EventPayload::SshKeyValidated { host, .. }
            | EventPayload::SshReconnect { host, .. } => Some(host),
            _ => None,
        }
    }
}
