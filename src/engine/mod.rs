//! Execution engine
//!
//! Front door of the crate. Owns the adapters, SSH pool, result cache,
//! event bus, temp leases and template registry; hands out
//! [`ProcessPromise`] handles and copy-on-write context views.

mod context;
mod fs;
mod temp;

pub use context::ContextConfig;
pub use fs::{pwd, which};
pub use temp::TempRegistry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use tracing::{debug, info};

use crate::adapters::docker::DockerAdapter;
use crate::adapters::kubernetes::KubernetesAdapter;
use crate::adapters::local::LocalAdapter;
use crate::adapters::remote_docker::RemoteDockerAdapter;
use crate::adapters::ssh::{PoolConfig, SshAdapter};
use crate::adapters::{resolve_kind, Adapter, MockAdapter};
use crate::command::{AdapterKind, Command, CommandTemplate, Target};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};
use crate::exec::cache::{fingerprint, CacheConfig, ResultCache};
use crate::exec::retry::run_with_retry;
use crate::exec::{ExecutionResult, ProcessPromise};

/// Engine-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    /// Override for the docker binary, e.g. `podman`.
    pub docker_binary: Option<String>,
    /// Override for the kubectl binary.
    pub kubectl_binary: Option<String>,
}

/// Shared engine internals; every view points at the same core.
pub struct EngineCore {
    bus: Arc<EventBus>,
    cache: ResultCache,
    local: Arc<LocalAdapter>,
    ssh: Arc<SshAdapter>,
    docker: Arc<DockerAdapter>,
    kubernetes: Arc<KubernetesAdapter>,
    remote_docker: Arc<RemoteDockerAdapter>,
    mock: parking_lot::RwLock<Option<Arc<MockAdapter>>>,
    temps: TempRegistry,
    templates: parking_lot::RwLock<HashMap<String, CommandTemplate>>,
    disposed: AtomicBool,
}

impl EngineCore {
    fn new(config: EngineConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let ssh = Arc::new(SshAdapter::new(config.pool.clone(), bus.clone()));
        let docker = Arc::new(match &config.docker_binary {
            Some(binary) => DockerAdapter::with_binary(binary.clone(), bus.clone()),
            None => DockerAdapter::new(bus.clone()),
        });
        let kubernetes = Arc::new(match &config.kubectl_binary {
            Some(binary) => KubernetesAdapter::with_binary(binary.clone(), bus.clone()),
            None => KubernetesAdapter::new(bus.clone()),
        });
        let remote_docker = Arc::new(RemoteDockerAdapter::new(ssh.clone(), bus.clone()));

        Arc::new(Self {
            cache: ResultCache::new(config.cache),
            local: Arc::new(LocalAdapter::new()),
            ssh,
            docker,
            kubernetes,
            remote_docker,
            mock: parking_lot::RwLock::new(None),
            temps: TempRegistry::new(bus.clone()),
            templates: parking_lot::RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            bus,
        })
    }

    fn adapter(&self, kind: AdapterKind) -> Result<Arc<dyn Adapter>> {
        Ok(match kind {
            AdapterKind::Local => self.local.clone(),
            AdapterKind::Ssh => self.ssh.clone(),
            AdapterKind::Docker => self.docker.clone(),
            AdapterKind::Kubernetes => self.kubernetes.clone(),
            AdapterKind::RemoteDocker => self.remote_docker.clone(),
            AdapterKind::Mock => self
                .mock
                .read()
                .clone()
                .ok_or_else(|| Error::AdapterUnavailable("no mock adapter installed".to_string()))?,
        })
    }

    /// Spawn algorithm: resolve the adapter, consult the cache, wrap in
    /// retries, dispatch, and emit the command lifecycle events.
    pub(crate) async fn dispatch(&self, cmd: Command) -> Result<ExecutionResult> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("engine".to_string()));
        }
        cmd.validate()?;

        let kind = resolve_kind(&cmd.target, self.mock.read().is_some());
        let adapter = self.adapter(kind)?;

        if let Some(policy) = cmd.cache.clone() {
            let key = policy
                .key
                .clone()
                .unwrap_or_else(|| fingerprint(&cmd, &policy.significant_env));
            return self
                .cache
                .get_or_build(&key, &policy, &self.bus, kind, || {
                    self.run_attempts(adapter.clone(), kind, cmd)
                })
                .await;
        }

        self.run_attempts(adapter, kind, cmd).await
    }

    async fn run_attempts(
        &self,
        adapter: Arc<dyn Adapter>,
        kind: AdapterKind,
        cmd: Command,
    ) -> Result<ExecutionResult> {
        let display = cmd.display_string();

        self.bus.emit(
            kind,
            EventPayload::CommandStart {
                command: display.clone(),
                args: (!cmd.args.is_empty()).then(|| cmd.args.clone()),
                cwd: cmd.cwd.as_ref().map(|p| p.display().to_string()),
                shell: cmd.shell_line.as_ref().and_then(|_| cmd.shell.program()),
                env: {
                    let env = cmd.merged_env();
                    (!env.is_empty() && !cmd.quiet).then_some(env)
                },
            },
        );
        let started = Instant::now();

        let outcome = match cmd.retry.clone() {
            Some(policy) => {
                run_with_retry(&policy, &self.bus, kind, || {
                    let adapter = adapter.clone();
                    let cmd = cmd.clone();
                    async move { adapter.execute(cmd).await }
                })
                .await
            }
            None => adapter.execute(cmd.clone()).await,
        };
        let duration = started.elapsed();

        match outcome {
            Ok(result) if result.ok() || cmd.nothrow => {
                self.bus.emit(
                    kind,
                    EventPayload::CommandComplete {
                        command: display,
                        exit_code: result.exit_code,
                        stdout: (!cmd.quiet).then(|| result.stdout_text()),
                        stderr: (!cmd.quiet).then(|| result.stderr_text()),
                        duration,
                    },
                );
                Ok(result)
            }
            Ok(result) => {
                let cause = result.cause().unwrap_or_else(|| "failed".to_string());
                self.bus.emit(
                    kind,
                    EventPayload::CommandError {
                        command: display,
                        error: cause,
                        duration,
                    },
                );
                Err(Error::CommandFailed(Box::new(result)))
            }
            Err(error) => {
                self.bus.emit(
                    kind,
                    EventPayload::CommandError {
                        command: display,
                        error: error.to_string(),
                        duration,
                    },
                );
                Err(error)
            }
        }
    }
}

/// Front-door API.
///
/// Cloning (or [`within`]) produces a cheap view over the same adapters,
/// pool, cache and bus; views differ only in their context stack.
///
/// [`within`]: ExecutionEngine::within
#[derive(Clone)]
pub struct ExecutionEngine {
    core: Arc<EngineCore>,
    context: context::ContextStack,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        info!("execution engine created");
        Self {
            core: EngineCore::new(config),
            context: context::ContextStack::default(),
        }
    }

    /// The shared event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.bus
    }

    /// View with an additional context frame; inner frames override outer
    /// ones, and the command itself wins over both.
    pub fn within(&self, frame: ContextConfig) -> Self {
        Self {
            core: self.core.clone(),
            context: self.context.push(frame),
        }
    }

    /// Install the scripted adapter used by `Target::Mock` and the `Auto`
    /// probe order.
    pub fn install_mock(&self, mock: Arc<MockAdapter>) {
        *self.core.mock.write() = Some(mock);
    }

    // ========================================================================
    // Spawning
    // ========================================================================

    /// Build a [`ProcessPromise`] for a command, applying the context
    /// stack.
    pub fn command(&self, mut cmd: Command) -> ProcessPromise {
        self.context.apply(&mut cmd);
        ProcessPromise::new(self.core.clone(), cmd)
    }

    /// Shorthand: shell line through the current context.
    pub fn sh(&self, line: impl Into<String>) -> ProcessPromise {
        self.command(Command::shell(line))
    }

    /// Execute to completion.
    pub async fn run(&self, cmd: Command) -> Result<ExecutionResult> {
        self.command(cmd).wait().await
    }

    // ========================================================================
    // Adapter access
    // ========================================================================

    /// SSH adapter, for tunnels and SFTP transfers.
    pub fn ssh(&self) -> &Arc<SshAdapter> {
        &self.core.ssh
    }

    /// Docker adapter, for managed containers, networks and volumes.
    pub fn docker(&self) -> &Arc<DockerAdapter> {
        &self.core.docker
    }

    /// Kubernetes adapter, for logs, port-forwards and copies.
    pub fn kubernetes(&self) -> &Arc<KubernetesAdapter> {
        &self.core.kubernetes
    }

    // ========================================================================
    // Utilities
    // ========================================================================

    /// Locate a program on `PATH`.
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        fs::which(program)
    }

    /// Current working directory.
    pub fn pwd(&self) -> Result<PathBuf> {
        fs::pwd()
    }

    /// Lease a temp file, reclaimed on dispose.
    pub fn temp_file(&self) -> Result<PathBuf> {
        self.core.temps.temp_file()
    }

    /// Lease a temp directory, reclaimed on dispose.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        self.core.temps.temp_dir()
    }

    fn active_target(&self) -> Target {
        let mut probe = Command::new("true");
        self.context.apply(&mut probe);
        probe.target
    }

    /// Read a file through the active adapter.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        fs::read_file(&self.core, &self.active_target(), path, &self.core.bus).await
    }

    /// Write a file through the active adapter.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        fs::write_file(&self.core, &self.active_target(), path, contents, &self.core.bus).await
    }

    /// Delete a file through the active adapter.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        fs::delete_file(&self.core, &self.active_target(), path, &self.core.bus).await
    }

    // ========================================================================
    // Templates
    // ========================================================================

    /// Register a named command template.
    pub fn register_template(&self, name: impl Into<String>, template: CommandTemplate) {
        self.core.templates.write().insert(name.into(), template);
    }

    pub fn template(&self, name: &str) -> Option<CommandTemplate> {
        self.core.templates.read().get(name).cloned()
    }

    /// Render a registered template into a shell-line promise, quoting
    /// values for whichever shell the current context selects.
    pub fn render_template(&self, name: &str, values: &[&str]) -> Result<ProcessPromise> {
        let template = self
            .template(name)
            .ok_or_else(|| Error::Validation(format!("unknown template: {}", name)))?;

        // The rendered line becomes a shell-line command, so quote for the
        // shell that command will resolve to under the context stack.
        let mut probe = Command::shell(String::new());
        self.context.apply(&mut probe);
        Ok(self.sh(template.render(&probe.shell, values)?))
    }

    // ========================================================================
    // Cache control
    // ========================================================================

    pub fn invalidate_cache(&self, key: &str) {
        self.core
            .cache
            .invalidate(key, &self.core.bus, AdapterKind::Local);
    }

    pub fn invalidate_cache_tag(&self, tag: &str) {
        self.core
            .cache
            .invalidate_tag(tag, &self.core.bus, AdapterKind::Local);
    }

    // ========================================================================
    // Disposal
    // ========================================================================

    /// Release everything: temp leases, pool connections, tunnels,
    /// adapters. Idempotent; events stop after the first call.
    pub async fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing execution engine");

        self.core.temps.cleanup();
        let _ = self.core.ssh.dispose().await;
        let _ = self.core.docker.dispose().await;
        let _ = self.core.kubernetes.dispose().await;
        let _ = self.core.remote_docker.dispose().await;
        let mock = self.core.mock.read().clone();
        if let Some(mock) = mock {
            let _ = mock.dispose().await;
        }
        self.core.cache.clear();
        self.core.bus.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Optional process-wide default engine
// ============================================================================

static DEFAULT_ENGINE: OnceLock<parking_lot::RwLock<Option<ExecutionEngine>>> = OnceLock::new();

fn default_slot() -> &'static parking_lot::RwLock<Option<ExecutionEngine>> {
    DEFAULT_ENGINE.get_or_init(|| parking_lot::RwLock::new(None))
}

/// Initialize (or fetch) the process-wide default engine.
pub fn init_default() -> ExecutionEngine {
    let slot = default_slot();
    if let Some(engine) = slot.read().clone() {
        return engine;
    }
    let mut guard = slot.write();
    guard.get_or_insert_with(ExecutionEngine::new).clone()
}

/// The default engine, if one was initialized and not disposed.
pub fn default_engine() -> Option<ExecutionEngine> {
    default_slot().read().clone()
}

/// Dispose and drop the process-wide default engine. Safe to call twice.
pub async fn dispose_default() {
    let engine = default_slot().write().take();
    if let Some(engine) = engine {
        engine.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_echo_through_engine() {
        let engine = ExecutionEngine::new();
        let result = engine
            .run(Command::new("printf").args(["%s", "hi"]).target(Target::Local))
            .await
            .unwrap();
        assert!(result.ok());
        assert_eq!(result.stdout, b"hi");
        assert_eq!(result.stderr, b"");
        assert_eq!(result.exit_code, 0);
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_raises_unless_nothrow() {
        let engine = ExecutionEngine::new();

        let failed = engine.run(Command::shell("exit 4")).await;
        match failed {
            Err(Error::CommandFailed(result)) => assert_eq!(result.exit_code, 4),
            other => panic!("unexpected: {:?}", other.map(|r| r.exit_code)),
        }

        let settled = engine
            .run(Command::shell("exit 4").nothrow())
            .await
            .unwrap();
        assert!(!settled.ok());
        assert_eq!(settled.exit_code, 4);
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_command_events_order() {
        let engine = ExecutionEngine::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let order2 = order.clone();
        engine.events().subscribe("command:*", move |event| {
            order2.lock().push(event.name().to_string());
        });

        engine.run(Command::shell("true")).await.unwrap();
        let _ = engine.run(Command::shell("false")).await;

        assert_eq!(
            order.lock().as_slice(),
            &[
                "command:start",
                "command:complete",
                "command:start",
                "command:error"
            ]
        );
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_within_context_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new();
        let view = engine.within(
            ContextConfig::default()
                .cwd(dir.path())
                .env("CTX_MARKER", "set"),
        );

        let result = view
            .run(Command::shell("printf '%s %s' \"$CTX_MARKER\" \"$PWD\""))
            .await
            .unwrap();
        let text = result.stdout_text();
        assert!(text.starts_with("set "));
        assert!(text.contains(&dir.path().canonicalize().unwrap().display().to_string()));

        // The base view is unaffected.
        let base = engine
            .run(Command::shell("printf '%s' \"${CTX_MARKER:-unset}\""))
            .await
            .unwrap();
        assert_eq!(base.stdout, b"unset");
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_mock_autodetect() {
        let engine = ExecutionEngine::new();
        let mock = Arc::new(MockAdapter::new());
        mock.push_output("from mock", 0);
        engine.install_mock(mock.clone());

        // Auto target prefers the installed mock.
        let result = engine.run(Command::new("anything")).await.unwrap();
        assert_eq!(result.stdout, b"from mock");
        assert_eq!(mock.invocation_count(), 1);
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_cache_single_flight_through_engine() {
        use std::sync::atomic::AtomicUsize;

        let engine = ExecutionEngine::new();
        let mock = Arc::new(MockAdapter::new());
        mock.set_delay(Duration::from_millis(30));
        for _ in 0..8 {
            mock.push_output("cached payload", 0);
        }
        engine.install_mock(mock.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        engine.events().subscribe("cache:hit", move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .run(
                        Command::new("date")
                            .arg("+%s")
                            .target(Target::Mock)
                            .cache(crate::exec::CachePolicy::ttl(Duration::from_secs(60))),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut outputs = Vec::new();
        for task in tasks {
            outputs.push(task.await.unwrap().stdout);
        }

        // One underlying execution; identical results for every caller.
        assert_eq!(mock.invocation_count(), 1);
        assert!(outputs.iter().all(|o| o == &outputs[0]));
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_retry_through_engine() {
        let engine = ExecutionEngine::new();
        let mock = Arc::new(MockAdapter::new());
        mock.push_error(|| Error::Connection {
            host: "flaky".into(),
            message: "reset".into(),
        });
        mock.push_output("recovered", 0);
        engine.install_mock(mock.clone());

        let result = engine
            .run(
                Command::new("probe")
                    .target(Target::Mock)
                    .retry(crate::exec::RetryPolicy {
                        initial_delay: Duration::from_millis(1),
                        ..crate::exec::RetryPolicy::new(3)
                    }),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, b"recovered");
        assert_eq!(mock.invocation_count(), 2);
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_idempotent_and_silent() {
        use std::sync::atomic::AtomicUsize;

        let engine = ExecutionEngine::new();
        let events = Arc::new(AtomicUsize::new(0));
        let events2 = events.clone();
        engine.events().subscribe("*", move |_| {
            events2.fetch_add(1, Ordering::SeqCst);
        });

        let temp = engine.temp_file().unwrap();
        assert!(temp.exists());

        engine.dispose().await;
        assert!(!temp.exists());
        let after_dispose = events.load(Ordering::SeqCst);

        // Post-dispose commands fail and emit nothing.
        let result = engine.run(Command::shell("true")).await;
        assert!(matches!(result, Err(Error::Disposed(_))));
        assert_eq!(events.load(Ordering::SeqCst), after_dispose);

        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_templates() {
        let engine = ExecutionEngine::new();
        engine.register_template(
            "greet",
            CommandTemplate::parse("printf '%s' {}").unwrap(),
        );

        let mut promise = engine.render_template("greet", &["hello world"]).unwrap();
        let result = promise.wait().await.unwrap();
        assert_eq!(result.stdout, b"hello world");

        assert!(engine.render_template("missing", &[]).is_err());
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_file_helpers_local() {
        let engine = ExecutionEngine::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let path_str = path.to_str().unwrap();

        engine.write_file(path_str, b"contents").await.unwrap();
        let read = engine.read_file(path_str).await.unwrap();
        assert_eq!(read, b"contents");

        engine.delete_file(path_str).await.unwrap();
        assert!(!path.exists());
        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_empty_env_not_inherited_through_engine() {
        std::env::set_var("UXEC_ENGINE_MARKER", "leak");
        let engine = ExecutionEngine::new();

        let result = engine
            .run(Command::new("env").env_clear())
            .await
            .unwrap();
        assert!(!result.stdout_text().contains("UXEC_ENGINE_MARKER"));
        engine.dispose().await;
    }
}
