//! One pooled SSH connection
//!
//! Wraps a russh client session: authentication, channel exec with
//! timeout/cancel handling, and the bookkeeping the pool needs (state,
//! refcounts, last-used stamps).

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::command::{
    AdapterKind, AuthMethod, Command, KeyMaterial, SshOptions, StdinSource,
};
use crate::error::{Error, Result};
use crate::events::{ConnectionType, EventBus, EventPayload};
use crate::exec::stream::{sleep_until_deadline, OutputCollector, ProgressTracker};
use crate::exec::ExecutionResult;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    InUse = 1,
    Reconnecting = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::InUse,
            2 => ConnectionState::Reconnecting,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Idle,
        }
    }
}

/// A reverse-tunnel channel accepted by the server, with the address it
/// was bound to.
pub(crate) type ForwardedChannel = (russh::Channel<client::Msg>, String, u32);

pub(crate) struct ClientHandler {
    reverse_tx: mpsc::UnboundedSender<ForwardedChannel>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Host-key policy is delegated to configuration layers above the
        // core; the transport accepts and records.
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = self
            .reverse_tx
            .send((channel, connected_address.to_string(), connected_port));
        Ok(())
    }
}

/// Map a POSIX signal name onto the SSH signal wire values.
fn to_ssh_signal(name: &str) -> Sig {
    match name.trim_start_matches("SIG") {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        "USR2" => Sig::Custom("USR2".to_string()),
        other => Sig::Custom(other.to_string()),
    }
}

/// A live SSH session plus pool bookkeeping.
pub struct SshConnection {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: String,
    handle: Mutex<Handle<ClientHandler>>,
    state: AtomicU8,
    in_use: AtomicUsize,
    total_execs: AtomicU64,
    last_used: parking_lot::Mutex<Instant>,
    pub(crate) created_at: Instant,
    /// Reverse-tunnel channels surface here; taken by the tunnel module.
    pub(crate) reverse_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ForwardedChannel>>>,
}

impl SshConnection {
    /// Open and authenticate a connection.
    pub async fn connect(
        opts: &SshOptions,
        keepalive_interval: Duration,
        bus: &EventBus,
    ) -> Result<Self> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(keepalive_interval),
            ..Default::default()
        });

        let (reverse_tx, reverse_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler { reverse_tx };

        let addr = (opts.host.as_str(), opts.port);
        let connect = client::connect(config, addr, handler);
        let mut handle = tokio::time::timeout(opts.connect_timeout, connect)
            .await
            .map_err(|_| Error::Connection {
                host: opts.host.clone(),
                message: format!("connect timed out after {:?}", opts.connect_timeout),
            })?
            .map_err(|e| Error::Connection {
                host: opts.host.clone(),
                message: e.to_string(),
            })?;

        Self::authenticate(&mut handle, opts, bus).await?;

        bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshConnect {
                host: opts.host.clone(),
                port: Some(opts.port),
                username: Some(opts.username.clone()),
            },
        );
        bus.emit(
            AdapterKind::Ssh,
            EventPayload::ConnectionOpen {
                connection_type: ConnectionType::Ssh,
                host: Some(opts.host.clone()),
                port: Some(opts.port),
                metadata: None,
            },
        );
        info!(host = %opts.host, port = opts.port, "ssh connection established");

        Ok(Self {
            host: opts.host.clone(),
            port: opts.port,
            username: opts.username.clone(),
            handle: Mutex::new(handle),
            state: AtomicU8::new(ConnectionState::Idle as u8),
            in_use: AtomicUsize::new(0),
            total_execs: AtomicU64::new(0),
            last_used: parking_lot::Mutex::new(Instant::now()),
            created_at: Instant::now(),
            reverse_rx: parking_lot::Mutex::new(Some(reverse_rx)),
        })
    }

    /// Try each configured auth method in the order supplied.
    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        opts: &SshOptions,
        bus: &EventBus,
    ) -> Result<()> {
        let mut last_failure = String::from("no auth methods configured");

        for method in &opts.auth {
            let outcome: std::result::Result<(), String> = match method {
                AuthMethod::PrivateKey { key, passphrase } => {
                    let key_pair = match key {
                        KeyMaterial::Path(path) => {
                            load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                                Error::Authentication {
                                    host: opts.host.clone(),
                                    username: opts.username.clone(),
                                    message: format!("failed to load key: {}", e),
                                }
                            })?
                        }
                        KeyMaterial::Inline(pem) => {
                            russh::keys::decode_secret_key(pem, passphrase.as_deref()).map_err(
                                |e| Error::Authentication {
                                    host: opts.host.clone(),
                                    username: opts.username.clone(),
                                    message: format!("failed to decode key: {}", e),
                                },
                            )?
                        }
                    };
                    let key_type = key_pair.algorithm().to_string();
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .ok()
                        .flatten()
                        .flatten();
                    let auth = handle
                        .authenticate_publickey(
                            opts.username.clone(),
                            PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                        )
                        .await;
                    match auth {
                        Ok(result) if result.success() => {
                            bus.emit(
                                AdapterKind::Ssh,
                                EventPayload::SshKeyValidated {
                                    host: opts.host.clone(),
                                    username: opts.username.clone(),
                                    key_type,
                                },
                            );
                            return Ok(());
                        }
                        Ok(_) => Err("public key rejected".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }

                AuthMethod::Password(password) => {
                    match handle
                        .authenticate_password(opts.username.clone(), password.clone())
                        .await
                    {
                        Ok(result) if result.success() => return Ok(()),
                        Ok(_) => Err("password rejected".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }

                AuthMethod::KeyboardInteractive(response) => {
                    match Self::keyboard_interactive(handle, &opts.username, response).await {
                        Ok(true) => return Ok(()),
                        Ok(false) => Err("keyboard-interactive rejected".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }

                AuthMethod::Agent { socket } => {
                    match Self::agent_auth(handle, &opts.username, socket.as_deref()).await {
                        Ok(true) => return Ok(()),
                        Ok(false) => Err("agent identities rejected".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }
            };

            if let Err(message) = outcome {
                debug!(host = %opts.host, %message, "auth method failed, trying next");
                last_failure = message;
            }
        }

        Err(Error::Authentication {
            host: opts.host.clone(),
            username: opts.username.clone(),
            message: last_failure,
        })
    }

    async fn keyboard_interactive(
        handle: &mut Handle<ClientHandler>,
        username: &str,
        response: &str,
    ) -> Result<bool> {
        use russh::client::KeyboardInteractiveAuthResponse;

        let mut reply = handle
            .authenticate_keyboard_interactive_start(username.to_string(), None)
            .await?;
        loop {
            match reply {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let answers = vec![response.to_string(); prompts.len()];
                    reply = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
                _ => return Ok(false),
            }
        }
    }

    #[cfg(unix)]
    async fn agent_auth(
        handle: &mut Handle<ClientHandler>,
        username: &str,
        socket: Option<&str>,
    ) -> Result<bool> {
        use russh::keys::agent::client::AgentClient;

        let mut agent = match socket {
            Some(path) => AgentClient::connect_uds(path).await?,
            None => AgentClient::connect_env().await?,
        };

        let identities = agent.request_identities().await?;
        for key in identities {
            let public_key = key.public_key().into_owned();
            let auth = handle
                .authenticate_publickey_with(username.to_string(), public_key, None, &mut agent)
                .await;
            if let Ok(result) = auth {
                if result.success() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn agent_auth(
        _handle: &mut Handle<ClientHandler>,
        _username: &str,
        _socket: Option<&str>,
    ) -> Result<bool> {
        Ok(false)
    }

    // ========================================================================
    // State bookkeeping
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn total_exec_count(&self) -> u64 {
        self.total_execs.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub(crate) fn checkout(&self) {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::InUse);
    }

    pub(crate) fn checkin(&self) {
        let before = self.in_use.fetch_sub(1, Ordering::SeqCst);
        *self.last_used.lock() = Instant::now();
        if before <= 1 && self.state() == ConnectionState::InUse {
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Channel-level ping: open and immediately close a session channel.
    pub(crate) async fn ping(&self) -> bool {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return false;
        }
        match tokio::time::timeout(Duration::from_secs(5), handle.channel_open_session()).await {
            Ok(Ok(channel)) => {
                let _ = channel.close().await;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn is_session_closed(&self) -> bool {
        self.handle.lock().await.is_closed()
    }

    /// Open a raw session channel on this connection.
    pub(crate) async fn open_channel(&self) -> Result<russh::Channel<client::Msg>> {
        let handle = self.handle.lock().await;
        Ok(handle.channel_open_session().await?)
    }

    /// Open a direct-tcpip channel toward `(host, port)`.
    pub(crate) async fn open_direct_tcpip(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: (&str, u16),
    ) -> Result<russh::Channel<client::Msg>> {
        let handle = self.handle.lock().await;
        Ok(handle
            .channel_open_direct_tcpip(
                remote_host,
                remote_port as u32,
                originator.0,
                originator.1 as u32,
            )
            .await?)
    }

    /// Request a remote listener for reverse tunnels.
    pub(crate) async fn request_remote_forward(&self, address: &str, port: u16) -> Result<()> {
        let mut handle = self.handle.lock().await;
        handle
            .tcpip_forward(address.to_string(), port as u32)
            .await
            .map_err(|e| Error::Tunnel(format!("remote bind {}:{} failed: {}", address, port, e)))?;
        Ok(())
    }

    pub(crate) async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<()> {
        let mut handle = self.handle.lock().await;
        handle
            .cancel_tcpip_forward(address.to_string(), port as u32)
            .await
            .map_err(|e| Error::Tunnel(e.to_string()))?;
        Ok(())
    }

    /// Tear the session down.
    pub(crate) async fn disconnect(&self, bus: &EventBus, reason: &str) {
        self.set_state(ConnectionState::Closed);
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshDisconnect {
                host: self.host.clone(),
                reason: Some(reason.to_string()),
            },
        );
        bus.emit(
            AdapterKind::Ssh,
            EventPayload::ConnectionClose {
                connection_type: ConnectionType::Ssh,
                host: Some(self.host.clone()),
                port: Some(self.port),
                reason: Some(reason.to_string()),
                metadata: None,
            },
        );
    }

    // ========================================================================
    // Exec
    // ========================================================================

    /// Run `remote_line` over a fresh channel, driving stdio per `cmd`.
    pub(crate) async fn exec(&self, cmd: &Command, remote_line: &str) -> Result<ExecutionResult> {
        self.total_execs.fetch_add(1, Ordering::SeqCst);

        let display = cmd.display_string();
        let started_at = Utc::now();
        let started = Instant::now();

        let mut channel = self.open_channel().await?;

        if cmd.interactive {
            channel
                .request_pty(false, "xterm-256color", 80, 24, 0, 0, &[])
                .await?;
        }

        channel.exec(true, remote_line).await?;

        // Stdin: fixed bytes or a streamed reader, then EOF.
        match &cmd.stdin {
            StdinSource::Bytes(bytes) => {
                channel.data(&bytes[..]).await?;
                channel.eof().await?;
            }
            StdinSource::Reader(shared) => {
                let reader = shared.lock().take();
                if let Some(reader) = reader {
                    channel.data(reader).await?;
                }
                channel.eof().await?;
            }
            StdinSource::Null => {
                channel.eof().await?;
            }
            StdinSource::Inherit => {
                // Remote exec cannot adopt the caller's terminal fd; the
                // pty request above covers the interactive case.
                channel.eof().await?;
            }
        }

        let mut stdout = OutputCollector::new(&cmd.stdout);
        let mut stderr = OutputCollector::new(&cmd.stderr);
        let mut progress = ProgressTracker::for_config(cmd.progress.as_ref());

        let cancel = cmd.cancel_token();
        let mut kill_rx = cmd.kill.register();
        let mut deadline = cmd.timeout.map(|t| Instant::now() + t);
        let mut stop_reason: Option<Error> = None;
        let mut signalled = false;

        let mut exit_code = 0i32;
        let mut exit_signal: Option<String> = None;

        loop {
            tokio::select! {
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            stdout.push(data).await?;
                            if let Some(tracker) = progress.as_mut() {
                                tracker.record_stdout(data);
                            }
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                            stderr.push(data).await?;
                            if let Some(tracker) = progress.as_mut() {
                                tracker.record_stderr(data);
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit_code = exit_status as i32;
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            exit_signal = Some(format!("{:?}", signal_name));
                        }
                        Some(_) => {}
                        None => break,
                    }
                }

                _ = cancel.cancelled(), if stop_reason.is_none() => {
                    stop_reason = Some(Error::Cancelled {
                        command: display.clone(),
                        partial: None,
                    });
                    let _ = channel.signal(to_ssh_signal(&cmd.timeout_signal)).await;
                    signalled = true;
                    deadline = Some(Instant::now() + cmd.kill_grace);
                }

                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    if stop_reason.is_none() {
                        stop_reason = Some(Error::Timeout {
                            command: display.clone(),
                            timeout: cmd.timeout.unwrap_or_default(),
                            partial: None,
                        });
                        let _ = channel.signal(to_ssh_signal(&cmd.timeout_signal)).await;
                        signalled = true;
                        deadline = Some(Instant::now() + cmd.kill_grace);
                    } else if signalled {
                        // Grace expired: abandon the channel.
                        let _ = channel.signal(Sig::KILL).await;
                        let _ = channel.close().await;
                        break;
                    }
                }

                Some(signal) = kill_rx.recv() => {
                    let _ = channel.signal(to_ssh_signal(&signal)).await;
                }
            }
        }

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;
        if let Some(tracker) = progress.as_mut() {
            tracker.report();
        }

        let mut result = ExecutionResult {
            stdout,
            stderr,
            exit_code,
            signal: exit_signal,
            duration: started.elapsed(),
            started_at,
            finished_at: Utc::now(),
            command: display,
            adapter: AdapterKind::Ssh,
            host: Some(self.host.clone()),
            container: None,
            pod: None,
        };

        match stop_reason {
            Some(Error::Timeout {
                command, timeout, ..
            }) => Err(Error::Timeout {
                command,
                timeout,
                partial: Some(Box::new(result)),
            }),
            Some(Error::Cancelled { command, .. }) => Err(Error::Cancelled {
                command,
                partial: Some(Box::new(result)),
            }),
            Some(other) => Err(other),
            None => {
                if result.signal.is_some() && result.exit_code == 0 {
                    result.exit_code = -1;
                }
                Ok(result)
            }
        }
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("state", &self.state())
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_round_trip() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::InUse,
            ConnectionState::Reconnecting,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_ssh_signal_mapping() {
        assert!(matches!(to_ssh_signal("TERM"), Sig::TERM));
        assert!(matches!(to_ssh_signal("SIGKILL"), Sig::KILL));
        assert!(matches!(to_ssh_signal("SIGINT"), Sig::INT));
        match to_ssh_signal("WINCH") {
            Sig::Custom(name) => assert_eq!(name, "WINCH"),
            other => panic!("expected custom signal, got {:?}", other),
        }
    }
}
