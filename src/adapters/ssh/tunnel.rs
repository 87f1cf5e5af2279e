//! SSH tunnels
//!
//! Forward tunnels bind a local listener and open a direct-tcpip channel
//! per accepted connection. Reverse tunnels ask the server for a remote
//! binding and connect back to a local address for each forwarded
//! channel. Closing a tunnel unbinds the listener and resets in-flight
//! streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::SshConnection;
use super::pool::PooledConnection;
use crate::command::AdapterKind;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};

/// Direction of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelDirection {
    /// Local listener forwarding to the remote side.
    Forward,
    /// Remote listener forwarding back to a local address.
    Reverse,
}

/// An open tunnel. Closing is idempotent; dropping the handle leaves the
/// tunnel to the adapter's dispose path when `auto_close` is set there.
pub struct Tunnel {
    direction: TunnelDirection,
    local_host: String,
    /// Actual bound port; for dynamic allocation this is the OS pick.
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    connection: Arc<SshConnection>,
    /// Pool lease; keeps the connection checked out (and so safe from the
    /// idle sweep) until the tunnel closes.
    lease: parking_lot::Mutex<Option<PooledConnection>>,
    cancel: CancellationToken,
    open: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    bus: Arc<EventBus>,
}

impl Tunnel {
    /// Bind `(local_host, local_port)` and forward accepted connections to
    /// `(remote_host, remote_port)` over the SSH connection.
    ///
    /// A `local_port` of zero asks the OS for a port; the pick is recorded
    /// on the handle.
    pub(crate) async fn open_forward(
        lease: PooledConnection,
        local_host: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let connection = lease.connection().clone();
        let listener = TcpListener::bind((local_host, local_port))
            .await
            .map_err(|e| {
                Error::Tunnel(format!(
                    "failed to bind {}:{}: {}",
                    local_host, local_port, e
                ))
            })?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| Error::Tunnel(e.to_string()))?
            .port();

        let tunnel = Arc::new(Self {
            direction: TunnelDirection::Forward,
            local_host: local_host.to_string(),
            local_port: bound_port,
            remote_host: remote_host.to_string(),
            remote_port,
            connection,
            lease: parking_lot::Mutex::new(Some(lease)),
            cancel: CancellationToken::new(),
            open: AtomicBool::new(true),
            tasks: parking_lot::Mutex::new(Vec::new()),
            bus: bus.clone(),
        });

        let accept_tunnel = tunnel.clone();
        let task = tokio::spawn(async move {
            Tunnel::accept_loop(accept_tunnel, listener).await;
        });
        tunnel.tasks.lock().push(task);

        bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshTunnelCreated {
                local_port: bound_port,
                remote_host: remote_host.to_string(),
                remote_port,
            },
        );

        Ok(tunnel)
    }

    async fn accept_loop(tunnel: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = tunnel.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "tunnel accept failed");
                            break;
                        }
                    };
                    debug!(%peer, remote = %tunnel.remote_host, "tunnel connection accepted");

                    let bridge = tunnel.clone();
                    let task = tokio::spawn(async move {
                        Tunnel::bridge_forward(bridge, stream, peer.ip().to_string(), peer.port())
                            .await;
                    });
                    tunnel.tasks.lock().push(task);
                }
            }
        }
        // The listener unbinds here; in-flight bridges are cut by the
        // cancellation token.
    }

    async fn bridge_forward(
        tunnel: Arc<Self>,
        mut stream: TcpStream,
        peer_ip: String,
        peer_port: u16,
    ) {
        let channel = match tunnel
            .connection
            .open_direct_tcpip(&tunnel.remote_host, tunnel.remote_port, (&peer_ip, peer_port))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "direct-tcpip open failed");
                return;
            }
        };

        let mut channel_stream = channel.into_stream();
        tokio::select! {
            _ = tunnel.cancel.cancelled() => {}
            result = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream) => {
                if let Err(e) = result {
                    debug!(error = %e, "tunnel stream ended with error");
                }
            }
        }
    }

    /// Request a remote binding and forward each remote-originated
    /// connection to `(local_host, local_port)`.
    pub(crate) async fn open_reverse(
        lease: PooledConnection,
        remote_host: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let connection = lease.connection().clone();
        connection
            .request_remote_forward(remote_host, remote_port)
            .await?;

        let mut reverse_rx = connection.reverse_rx.lock().take().ok_or_else(|| {
            Error::Tunnel("reverse channel receiver already claimed on this connection".to_string())
        })?;

        let tunnel = Arc::new(Self {
            direction: TunnelDirection::Reverse,
            local_host: local_host.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            connection,
            lease: parking_lot::Mutex::new(Some(lease)),
            cancel: CancellationToken::new(),
            open: AtomicBool::new(true),
            tasks: parking_lot::Mutex::new(Vec::new()),
            bus: bus.clone(),
        });

        let accept_tunnel = tunnel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_tunnel.cancel.cancelled() => break,
                    forwarded = reverse_rx.recv() => {
                        let Some((channel, _address, _port)) = forwarded else { break };

                        let target =
                            (accept_tunnel.local_host.clone(), accept_tunnel.local_port);
                        let cancel = accept_tunnel.cancel.clone();
                        let task = tokio::spawn(async move {
                            let mut local = match TcpStream::connect(target).await {
                                Ok(stream) => stream,
                                Err(e) => {
                                    warn!(error = %e, "reverse tunnel local connect failed");
                                    return;
                                }
                            };
                            let mut channel_stream = channel.into_stream();
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::io::copy_bidirectional(
                                    &mut local,
                                    &mut channel_stream,
                                ) => {}
                            }
                        });
                        accept_tunnel.tasks.lock().push(task);
                    }
                }
            }
        });
        tunnel.tasks.lock().push(task);

        bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshTunnelCreated {
                local_port,
                remote_host: remote_host.to_string(),
                remote_port,
            },
        );

        Ok(tunnel)
    }

    pub fn direction(&self) -> TunnelDirection {
        self.direction
    }

    /// Actual local port (the OS pick for dynamic allocation).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_endpoint(&self) -> (&str, u16) {
        (&self.remote_host, self.remote_port)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Unbind the listener and reset in-flight streams. Idempotent.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            if self.direction == TunnelDirection::Reverse {
                let _ = self
                    .connection
                    .cancel_remote_forward(&self.remote_host, self.remote_port)
                    .await;
            }
            // Return the connection to the pool.
            self.lease.lock().take();
            self.bus.emit(
                AdapterKind::Ssh,
                EventPayload::SshTunnelClosed {
                    local_port: self.local_port,
                },
            );
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("direction", &self.direction)
            .field("local", &format!("{}:{}", self.local_host, self.local_port))
            .field(
                "remote",
                &format!("{}:{}", self.remote_host, self.remote_port),
            )
            .field("open", &self.is_open())
            .finish()
    }
}
