//! SSH adapter
//!
//! Executes commands on remote hosts over pooled SSH connections, opens
//! forward/reverse tunnels, and transfers files over SFTP. Env and cwd are
//! inlined into the remote command line; sudo policy wraps the line and
//! delivers the password per the configured method.

mod connection;
mod pool;
mod sftp;
mod tunnel;

pub use connection::{ConnectionState, SshConnection};
pub use pool::{PoolConfig, PoolKey, PooledConnection, SshPool};
pub use sftp::{PathFilter, SftpClient};
pub use tunnel::{Tunnel, TunnelDirection};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use super::{Adapter, Capabilities};
use crate::command::{
    AdapterKind, Command, PasswordMethod, Shell, SshOptions, StdinSource, SudoConfig, Target,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};
use crate::exec::ExecutionResult;

/// Remote rendering of a command: the line sent over the wire and a
/// redacted copy safe for event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteLine {
    pub wire: String,
    pub redacted: String,
}

/// Build the remote shell line: env exports, cwd prefix, then the body,
/// optionally wrapped in sudo.
pub(crate) fn build_remote_line(cmd: &Command, sudo: Option<&SudoConfig>) -> Result<RemoteLine> {
    let body = match (&cmd.shell_line, &cmd.shell) {
        (Some(line), Shell::Path(path)) => format!(
            "{} -c {}",
            shell_words::quote(&path.to_string_lossy()),
            shell_words::quote(line)
        ),
        (Some(line), _) => line.clone(),
        (None, _) => {
            let mut parts = Vec::with_capacity(1 + cmd.args.len());
            parts.push(
                cmd.program
                    .clone()
                    .ok_or_else(|| Error::Validation("command has no program".to_string()))?,
            );
            parts.extend(cmd.args.iter().cloned());
            shell_words::join(parts.iter().map(String::as_str))
        }
    };

    let mut line = String::new();
    let env = cmd.merged_env();
    if !env.is_empty() {
        line.push_str("export");
        for (key, value) in &env {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&shell_words::quote(value));
        }
        line.push_str("; ");
    }
    if let Some(cwd) = &cmd.cwd {
        line.push_str("cd ");
        line.push_str(&shell_words::quote(&cwd.to_string_lossy()));
        line.push_str(" && ");
    }
    line.push_str(&body);

    let Some(sudo) = sudo.filter(|s| s.enabled) else {
        return Ok(RemoteLine {
            redacted: line.clone(),
            wire: line,
        });
    };

    let user_flag = sudo
        .user
        .as_deref()
        .map(|user| format!("-u {} ", shell_words::quote(user)))
        .unwrap_or_default();
    let quoted = shell_words::quote(&line).into_owned();

    let (wire, redacted) = match sudo.password_method {
        // Password arrives on stdin ahead of the command's own input.
        PasswordMethod::Stdin | PasswordMethod::Secure => {
            let wrapped = format!("sudo -S -p '' {}sh -c {}", user_flag, quoted);
            (wrapped.clone(), wrapped)
        }
        PasswordMethod::Echo => {
            let password = sudo.password.clone().unwrap_or_default();
            (
                format!(
                    "printf '%s\\n' {} | sudo -S -p '' {}sh -c {}",
                    shell_words::quote(&password),
                    user_flag,
                    quoted
                ),
                format!(
                    "printf '%s\\n' '***' | sudo -S -p '' {}sh -c {}",
                    user_flag, quoted
                ),
            )
        }
        // Relies on a remotely configured SUDO_ASKPASS helper.
        PasswordMethod::Askpass => {
            let wrapped = format!("sudo -A {}sh -c {}", user_flag, quoted);
            (wrapped.clone(), wrapped)
        }
    };

    Ok(RemoteLine { wire, redacted })
}

/// Prefix the sudo password onto the command's stdin for the stdin-based
/// delivery methods.
fn prefix_sudo_password(cmd: &mut Command, sudo: &SudoConfig) {
    if !matches!(
        sudo.password_method,
        PasswordMethod::Stdin | PasswordMethod::Secure
    ) {
        return;
    }
    let Some(password) = &sudo.password else {
        return;
    };
    let mut prefix = password.clone().into_bytes();
    prefix.push(b'\n');

    cmd.stdin = match std::mem::take(&mut cmd.stdin) {
        StdinSource::Null | StdinSource::Inherit => StdinSource::Bytes(Bytes::from(prefix)),
        StdinSource::Bytes(bytes) => {
            prefix.extend_from_slice(&bytes);
            StdinSource::Bytes(Bytes::from(prefix))
        }
        StdinSource::Reader(shared) => {
            let reader = shared.lock().take();
            match reader {
                Some(reader) => {
                    use tokio::io::AsyncReadExt;
                    let chained = std::io::Cursor::new(prefix).chain(reader);
                    StdinSource::Reader(Arc::new(parking_lot::Mutex::new(Some(Box::new(
                        chained,
                    )))))
                }
                None => StdinSource::Bytes(Bytes::from(prefix)),
            }
        }
    };
}

/// Adapter executing commands over SSH.
pub struct SshAdapter {
    pool: Arc<SshPool>,
    bus: Arc<EventBus>,
    tunnels: parking_lot::Mutex<Vec<Arc<Tunnel>>>,
    disposed: AtomicBool,
}

impl SshAdapter {
    pub fn new(config: PoolConfig, bus: Arc<EventBus>) -> Self {
        Self {
            pool: SshPool::new(config, bus.clone()),
            bus,
            tunnels: parking_lot::Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<SshPool> {
        &self.pool
    }

    fn options_of(cmd: &Command) -> Result<SshOptions> {
        match &cmd.target {
            Target::Ssh(opts) => Ok(opts.clone()),
            other => Err(Error::Validation(format!(
                "ssh adapter cannot execute a {:?} target",
                other.kind()
            ))),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("ssh adapter".to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Tunnels
    // ========================================================================

    /// Open a forward tunnel; `local_port` zero asks the OS for a port.
    pub async fn forward_tunnel(
        &self,
        opts: &SshOptions,
        local_host: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Arc<Tunnel>> {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let tunnel = Tunnel::open_forward(
            lease,
            local_host,
            local_port,
            remote_host,
            remote_port,
            self.bus.clone(),
        )
        .await?;
        self.tunnels.lock().push(tunnel.clone());
        Ok(tunnel)
    }

    /// Open a reverse tunnel from `(remote_host, remote_port)` back to
    /// `(local_host, local_port)`.
    pub async fn reverse_tunnel(
        &self,
        opts: &SshOptions,
        remote_host: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<Arc<Tunnel>> {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let tunnel = Tunnel::open_reverse(
            lease,
            remote_host,
            remote_port,
            local_host,
            local_port,
            self.bus.clone(),
        )
        .await?;
        self.tunnels.lock().push(tunnel.clone());
        Ok(tunnel)
    }

    // ========================================================================
    // SFTP
    // ========================================================================

    pub async fn upload_file(&self, opts: &SshOptions, local: &Path, remote: &str) -> Result<u64> {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let client = SftpClient::open(lease.connection(), self.bus.clone()).await?;
        client.upload_file(local, remote).await
    }

    pub async fn download_file(
        &self,
        opts: &SshOptions,
        remote: &str,
        local: &Path,
    ) -> Result<u64> {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let client = SftpClient::open(lease.connection(), self.bus.clone()).await?;
        client.download_file(remote, local).await
    }

    pub async fn upload_directory(
        &self,
        opts: &SshOptions,
        local: &Path,
        remote: &str,
        filter: Option<PathFilter>,
        concurrency: usize,
    ) -> Result<u64> {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let client = SftpClient::open(lease.connection(), self.bus.clone()).await?;
        client
            .upload_directory(local, remote, filter, concurrency)
            .await
    }

    pub async fn download_directory(
        &self,
        opts: &SshOptions,
        remote: &str,
        local: &Path,
    ) -> Result<u64> {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let client = SftpClient::open(lease.connection(), self.bus.clone()).await?;
        client.download_directory(remote, local).await
    }

    pub async fn upload_stream<R>(
        &self,
        opts: &SshOptions,
        reader: R,
        remote: &str,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.check_live()?;
        let lease = self.pool.acquire(opts).await?;
        let client = SftpClient::open(lease.connection(), self.bus.clone()).await?;
        client.upload_stream(reader, remote).await
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Ssh
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tty: true,
            transfer: true,
            tunnel: true,
            port_forward: false,
            health: false,
        }
    }

    async fn execute(&self, cmd: Command) -> Result<ExecutionResult> {
        self.check_live()?;
        cmd.validate()?;
        let opts = Self::options_of(&cmd)?;

        let mut cmd = cmd;
        let line = build_remote_line(&cmd, opts.sudo.as_ref())?;
        if let Some(sudo) = &opts.sudo {
            prefix_sudo_password(&mut cmd, sudo);
        }

        let lease = self.pool.acquire(&opts).await?;

        self.bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshExecute {
                host: opts.host.clone(),
                command: line.redacted.clone(),
            },
        );

        let outcome = lease.connection().exec(&cmd, &line.wire).await;
        if matches!(outcome, Err(Error::Ssh(_)) | Err(Error::Connection { .. })) {
            lease.mark_broken();
        }
        outcome
    }

    async fn is_available(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.lock().drain(..).collect();
        for tunnel in tunnels {
            tunnel.close().await;
        }
        self.pool.dispose().await;
        Ok(())
    }
}
