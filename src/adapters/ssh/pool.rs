//! SSH connection pool
//!
//! Connections are keyed by `(host, port, username, auth fingerprint)` and
//! bounded per host and in total. Acquirers above the caps wait FIFO until
//! a release or the acquire timeout. Maintenance tasks keep the pool
//! healthy: keepalive pings, idle sweeps and a metrics emitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{ConnectionState, SshConnection};
use crate::command::{AdapterKind, SshOptions};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};

/// Pool-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_per_host: usize,
    /// Idle connections past this age are swept.
    pub max_idle: Duration,
    /// Optional hard cap on connection age, busy or not.
    pub max_lifetime: Option<Duration>,
    /// How long an acquire waits above the caps before failing.
    pub acquire_timeout: Duration,
    pub keepalive_interval: Duration,
    pub sweep_interval: Duration,
    /// Cadence for `ssh:pool-metrics`; zero disables the emitter.
    pub metrics_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 16,
            max_per_host: 4,
            max_idle: Duration::from_secs(300),
            max_lifetime: None,
            acquire_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(30),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// Pool identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_fingerprint: String,
}

impl PoolKey {
    pub fn for_options(opts: &SshOptions) -> Self {
        Self {
            host: opts.host.clone(),
            port: opts.port,
            username: opts.username.clone(),
            auth_fingerprint: opts.auth_fingerprint(),
        }
    }
}

/// A checked-out connection. Returns itself to the pool on drop.
pub struct PooledConnection {
    connection: Arc<SshConnection>,
    /// Marked when the holder observed a transport failure; the pool
    /// discards the connection instead of reusing it.
    broken: AtomicBool,
    _total_permit: OwnedSemaphorePermit,
    _host_permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<SshConnection> {
        &self.connection
    }

    /// Flag the connection as unusable; it is closed on release.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken.load(Ordering::SeqCst) {
            self.connection.set_state(ConnectionState::Closed);
        }
        self.connection.checkin();
    }
}

struct PoolState {
    connections: HashMap<PoolKey, Vec<Arc<SshConnection>>>,
    host_semaphores: HashMap<PoolKey, Arc<Semaphore>>,
}

/// Bounded pool of SSH connections shared by an engine.
pub struct SshPool {
    config: PoolConfig,
    state: parking_lot::Mutex<PoolState>,
    total_permits: Arc<Semaphore>,
    reuse_count: AtomicU64,
    bus: Arc<EventBus>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SshPool {
    pub fn new(config: PoolConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let pool = Arc::new(Self {
            total_permits: Arc::new(Semaphore::new(config.max_total)),
            config,
            state: parking_lot::Mutex::new(PoolState {
                connections: HashMap::new(),
                host_semaphores: HashMap::new(),
            }),
            reuse_count: AtomicU64::new(0),
            bus,
            tasks: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        Self::spawn_maintenance(&pool);
        pool
    }

    fn spawn_maintenance(pool: &Arc<Self>) {
        let mut tasks = pool.tasks.lock();

        let sweeper = Arc::downgrade(pool);
        let sweep_interval = pool.config.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = sweeper.upgrade() else { break };
                pool.sweep_idle().await;
            }
        }));

        let pinger = Arc::downgrade(pool);
        let keepalive_interval = pool.config.keepalive_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pinger.upgrade() else { break };
                pool.keepalive_round().await;
            }
        }));

        if !pool.config.metrics_interval.is_zero() {
            let reporter = Arc::downgrade(pool);
            let metrics_interval = pool.config.metrics_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(metrics_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(pool) = reporter.upgrade() else { break };
                    pool.emit_metrics();
                }
            }));
        }
    }

    /// Check a connection out of the pool, opening one if needed.
    pub async fn acquire(&self, opts: &SshOptions) -> Result<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("ssh pool".to_string()));
        }

        let key = PoolKey::for_options(opts);
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;

        let total_permit = tokio::time::timeout_at(
            deadline,
            self.total_permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::ResourceExhausted(format!(
                "ssh pool: no capacity within {:?} (max_total {})",
                self.config.acquire_timeout, self.config.max_total
            ))
        })?
        .map_err(|_| Error::Disposed("ssh pool".to_string()))?;

        let host_semaphore = {
            let mut state = self.state.lock();
            state
                .host_semaphores
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_host)))
                .clone()
        };

        let host_permit = tokio::time::timeout_at(deadline, host_semaphore.acquire_owned())
            .await
            .map_err(|_| {
                Error::ResourceExhausted(format!(
                    "ssh pool: host {} at capacity within {:?} (max_per_host {})",
                    key.host, self.config.acquire_timeout, self.config.max_per_host
                ))
            })?
            .map_err(|_| Error::Disposed("ssh pool".to_string()))?;

        // Fast path: reuse an idle connection for this key.
        let reused = {
            let state = self.state.lock();
            state.connections.get(&key).and_then(|conns| {
                conns
                    .iter()
                    .find(|c| c.state() == ConnectionState::Idle)
                    .cloned()
            })
        };

        let connection = match reused {
            Some(connection) => {
                self.reuse_count.fetch_add(1, Ordering::SeqCst);
                debug!(host = %key.host, "reusing pooled ssh connection");
                connection
            }
            None => {
                let connection = self.connect_with_reconnect(opts).await?;
                let connection = Arc::new(connection);
                self.state
                    .lock()
                    .connections
                    .entry(key.clone())
                    .or_default()
                    .push(connection.clone());
                connection
            }
        };

        connection.checkout();
        Ok(PooledConnection {
            connection,
            broken: AtomicBool::new(false),
            _total_permit: total_permit,
            _host_permit: host_permit,
        })
    }

    /// Open a connection, retrying transient transport failures with
    /// exponential backoff. Auth rejections surface immediately.
    async fn connect_with_reconnect(&self, opts: &SshOptions) -> Result<SshConnection> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match SshConnection::connect(opts, self.config.keepalive_interval, &self.bus).await {
                Ok(connection) => {
                    if attempt > 1 {
                        self.bus.emit(
                            AdapterKind::Ssh,
                            EventPayload::SshReconnect {
                                host: opts.host.clone(),
                                attempts: attempt,
                                success: Some(true),
                            },
                        );
                    }
                    return Ok(connection);
                }
                Err(error) => {
                    let transient = error.is_transient();
                    if !transient || attempt > self.config.reconnect_attempts {
                        if attempt > 1 {
                            self.bus.emit(
                                AdapterKind::Ssh,
                                EventPayload::SshReconnect {
                                    host: opts.host.clone(),
                                    attempts: attempt,
                                    success: Some(false),
                                },
                            );
                        }
                        return Err(error);
                    }

                    let delay = self
                        .config
                        .reconnect_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        host = %opts.host,
                        attempt,
                        ?delay,
                        %error,
                        "ssh connect failed, backing off"
                    );
                    self.bus.emit(
                        AdapterKind::Ssh,
                        EventPayload::SshReconnect {
                            host: opts.host.clone(),
                            attempts: attempt,
                            success: None,
                        },
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn sweep_idle(&self) {
        let to_close: Vec<Arc<SshConnection>> = {
            let mut state = self.state.lock();
            let mut swept = Vec::new();
            for conns in state.connections.values_mut() {
                conns.retain(|conn| {
                    let closed = conn.state() == ConnectionState::Closed;
                    let expired = conn.state() == ConnectionState::Idle
                        && conn.in_use_count() == 0
                        && conn.idle_for() >= self.config.max_idle;
                    let over_lifetime = self
                        .config
                        .max_lifetime
                        .is_some_and(|max| conn.created_at.elapsed() >= max)
                        && conn.in_use_count() == 0;

                    if closed || expired || over_lifetime {
                        swept.push(conn.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            state.connections.retain(|_, conns| !conns.is_empty());
            swept
        };

        if to_close.is_empty() {
            return;
        }

        let cleaned = to_close.len();
        for conn in to_close {
            conn.disconnect(&self.bus, "idle sweep").await;
        }

        let remaining = self.live_count();
        info!(cleaned, remaining, "swept idle ssh connections");
        self.bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshPoolCleanup {
                cleaned,
                remaining,
                reason: Some("idle".to_string()),
            },
        );
    }

    async fn keepalive_round(&self) {
        let idle: Vec<Arc<SshConnection>> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .flatten()
                .filter(|c| c.state() == ConnectionState::Idle)
                .cloned()
                .collect()
        };

        for conn in idle {
            if conn.is_session_closed().await || !conn.ping().await {
                warn!(host = %conn.host, "keepalive failed, marking connection unhealthy");
                conn.set_state(ConnectionState::Closed);
            }
        }
    }

    fn emit_metrics(&self) {
        let state = self.state.lock();
        let mut total = 0usize;
        let mut active = 0usize;
        let mut idle = 0usize;
        let mut idle_time = Duration::ZERO;

        for conn in state.connections.values().flatten() {
            total += 1;
            match conn.state() {
                ConnectionState::InUse => active += 1,
                ConnectionState::Idle => {
                    idle += 1;
                    idle_time += conn.idle_for();
                }
                _ => {}
            }
        }
        drop(state);

        let avg_idle_time = if idle > 0 {
            idle_time / idle as u32
        } else {
            Duration::ZERO
        };

        self.bus.emit(
            AdapterKind::Ssh,
            EventPayload::SshPoolMetrics {
                total,
                active,
                idle,
                reuse_count: self.reuse_count.load(Ordering::SeqCst),
                avg_idle_time,
            },
        );
    }

    /// Number of live (non-closed) connections.
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .flatten()
            .filter(|c| c.state() != ConnectionState::Closed)
            .count()
    }

    pub fn reuse_count(&self) -> u64 {
        self.reuse_count.load(Ordering::SeqCst)
    }

    /// Close everything and stop maintenance. Idempotent.
    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let all: Vec<Arc<SshConnection>> = {
            let mut state = self.state.lock();
            let all = state.connections.values().flatten().cloned().collect();
            state.connections.clear();
            all
        };
        for conn in all {
            conn.disconnect(&self.bus, "pool disposed").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::AuthMethod;

    fn options() -> SshOptions {
        SshOptions::new("pool-test-host", "tester")
            .auth(AuthMethod::Password("secret".into()))
    }

    #[test]
    fn test_pool_key_includes_auth_fingerprint() {
        let a = PoolKey::for_options(&options());
        let b = PoolKey::for_options(&options());
        assert_eq!(a, b);

        let changed =
            SshOptions::new("pool-test-host", "tester").auth(AuthMethod::Password("other".into()));
        let c = PoolKey::for_options(&changed);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        // An unroutable host means the pool spends the acquire budget on
        // permits, not sockets: max_total of zero permits is not
        // expressible, so exhaust a one-slot pool with a held permit.
        let bus = Arc::new(EventBus::new());
        let pool = SshPool::new(
            PoolConfig {
                max_total: 1,
                max_per_host: 1,
                acquire_timeout: Duration::from_millis(50),
                reconnect_attempts: 0,
                ..Default::default()
            },
            bus,
        );

        let _held = pool.total_permits.clone().acquire_owned().await.unwrap();

        let result = pool.acquire(&options()).await;
        assert!(matches!(result, Err(Error::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let pool = SshPool::new(PoolConfig::default(), bus);

        pool.dispose().await;
        pool.dispose().await;

        let result = pool.acquire(&options()).await;
        assert!(matches!(result, Err(Error::Disposed(_))));
    }
}
