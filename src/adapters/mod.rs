//! Adapter contract and registry
//!
//! An adapter knows how to execute a [`Command`] in one kind of target
//! environment. The engine owns one instance per kind and dispatches by
//! the command's target.

pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod mock;
pub mod remote_docker;
pub mod ssh;

pub use mock::MockAdapter;

use async_trait::async_trait;

use crate::command::{AdapterKind, Command, Target};
use crate::error::Result;
use crate::exec::ExecutionResult;

/// Capability set an adapter declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Output is delivered incrementally while the command runs.
    pub streaming: bool,
    /// Pseudo-TTY allocation.
    pub tty: bool,
    /// File upload/download.
    pub transfer: bool,
    /// Forward/reverse TCP tunnels.
    pub tunnel: bool,
    /// Kubernetes-style port forwarding.
    pub port_forward: bool,
    /// Health waits on managed resources.
    pub health: bool,
}

/// Contract every backend implements.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Which target kind this adapter serves.
    fn kind(&self) -> AdapterKind;

    /// Declared capability set.
    fn capabilities(&self) -> Capabilities;

    /// Execute one command to completion.
    ///
    /// Non-zero exits settle as `Ok` results; only transport, validation
    /// timeout and cancellation failures are `Err`. The engine applies the
    /// `nothrow` policy on top.
    async fn execute(&self, cmd: Command) -> Result<ExecutionResult>;

    /// Whether the backend is usable right now.
    async fn is_available(&self) -> bool;

    /// Release transport resources. Idempotent.
    async fn dispose(&self) -> Result<()>;
}

/// Resolve the adapter kind for a target.
///
/// Explicit targets win. `Auto` probes mock (when one is installed) then
/// falls back to local; it never speculates about transports that need
/// addressing the command does not carry.
pub fn resolve_kind(target: &Target, mock_installed: bool) -> AdapterKind {
    match target.kind() {
        Some(kind) => kind,
        None if mock_installed => AdapterKind::Mock,
        None => AdapterKind::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DockerOptions, SshOptions};

    #[test]
    fn test_resolve_explicit_targets() {
        assert_eq!(
            resolve_kind(&Target::Local, false),
            AdapterKind::Local
        );
        assert_eq!(
            resolve_kind(&Target::Ssh(SshOptions::new("h", "u")), true),
            AdapterKind::Ssh
        );
        assert_eq!(
            resolve_kind(&Target::Docker(DockerOptions::container("web")), false),
            AdapterKind::Docker
        );
    }

    #[test]
    fn test_resolve_auto() {
        assert_eq!(resolve_kind(&Target::Auto, false), AdapterKind::Local);
        assert_eq!(resolve_kind(&Target::Auto, true), AdapterKind::Mock);
    }
}
