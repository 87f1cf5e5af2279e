//! ProcessPromise runtime
//!
//! One configuration bound to one eventual result. Builder mutators apply
//! while the promise is still configuring; `spawn` hands the command to
//! the engine on a background task; `wait` and the output decoders settle
//! it exactly once. Piping connects one promise's stdout to the next
//! promise's stdin, with the right-most process supplying the terminal
//! result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::command::{Command, KillSwitch, ProgressConfig, Shell, StdinSource};
use crate::engine::EngineCore;
use crate::error::{Error, Result};
use crate::exec::cache::CachePolicy;
use crate::exec::retry::RetryPolicy;
use crate::exec::ExecutionResult;

/// Writable handle to an in-flight process's stdin.
///
/// Writes before spawn are buffered in the channel; writes after the
/// process settles fail with a broken-pipe error.
#[derive(Clone)]
pub struct StdinHandle {
    tx: mpsc::Sender<Bytes>,
}

impl StdinHandle {
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.tx.send(data.into()).await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "process stdin is closed",
            ))
        })
    }

    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.write(data).await
    }

    /// Signal EOF by dropping the sender side.
    pub fn close(self) {}
}

enum PromiseState {
    Configuring(Box<Command>),
    Spawned(JoinHandle<Result<ExecutionResult>>),
    Settled(std::result::Result<ExecutionResult, Arc<Error>>),
}

/// Chainable handle to one in-flight or settled command.
pub struct ProcessPromise {
    engine: Arc<EngineCore>,
    state: PromiseState,
    kill: KillSwitch,
    /// Weak side of the stdin channel: the promise must not hold a live
    /// sender, or the child would never see EOF.
    stdin: Option<mpsc::WeakSender<Bytes>>,
    /// Upstream processes in a pipeline; joined on settlement.
    predecessors: Vec<JoinHandle<Result<ExecutionResult>>>,
}

impl ProcessPromise {
    pub(crate) fn new(engine: Arc<EngineCore>, cmd: Command) -> Self {
        let kill = cmd.kill.clone();
        Self {
            engine,
            state: PromiseState::Configuring(Box::new(cmd)),
            kill,
            stdin: None,
            predecessors: Vec::new(),
        }
    }

    fn configuring(&mut self, what: &str) -> Option<&mut Command> {
        match &mut self.state {
            PromiseState::Configuring(cmd) => Some(cmd),
            _ => {
                warn!(mutator = what, "ignored mutator on spawned process");
                None
            }
        }
    }

    // ========================================================================
    // Configuring-state mutators
    // ========================================================================

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        if let Some(cmd) = self.configuring("cwd") {
            cmd.cwd = Some(cwd.into());
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(cmd) = self.configuring("env") {
            cmd.env
                .get_or_insert_with(Default::default)
                .insert(key.into(), value.into());
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(cmd) = self.configuring("timeout") {
            cmd.timeout = Some(timeout);
        }
        self
    }

    pub fn timeout_signal(mut self, signal: impl Into<String>) -> Self {
        if let Some(cmd) = self.configuring("timeout_signal") {
            cmd.timeout_signal = signal.into();
        }
        self
    }

    pub fn shell(mut self, shell: Shell) -> Self {
        if let Some(cmd) = self.configuring("shell") {
            cmd.shell = shell;
        }
        self
    }

    pub fn quiet(mut self) -> Self {
        if let Some(cmd) = self.configuring("quiet") {
            cmd.quiet = true;
        }
        self
    }

    pub fn nothrow(mut self) -> Self {
        if let Some(cmd) = self.configuring("nothrow") {
            cmd.nothrow = true;
        }
        self
    }

    pub fn interactive(mut self) -> Self {
        if let Some(cmd) = self.configuring("interactive") {
            cmd.interactive = true;
            cmd.stdin = StdinSource::Inherit;
            cmd.stdout = crate::command::OutputSink::Inherit;
            cmd.stderr = crate::command::OutputSink::Inherit;
        }
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        if let Some(cmd) = self.configuring("retry") {
            cmd.retry = Some(policy);
        }
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        if let Some(cmd) = self.configuring("cache") {
            cmd.cache = Some(policy);
        }
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        if let Some(cmd) = self.configuring("cancel") {
            cmd.cancel = Some(token);
        }
        self
    }

    pub fn stdin_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        if let Some(cmd) = self.configuring("stdin_bytes") {
            cmd.stdin = StdinSource::Bytes(bytes.into());
        }
        self
    }

    pub fn stdout_writer(
        mut self,
        writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Self {
        if let Some(cmd) = self.configuring("stdout_writer") {
            cmd.stdout =
                crate::command::OutputSink::Writer(Arc::new(parking_lot::Mutex::new(Some(writer))));
        }
        self
    }

    pub fn stderr_writer(
        mut self,
        writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Self {
        if let Some(cmd) = self.configuring("stderr_writer") {
            cmd.stderr =
                crate::command::OutputSink::Writer(Arc::new(parking_lot::Mutex::new(Some(writer))));
        }
        self
    }

    pub fn progress(mut self, progress: ProgressConfig) -> Self {
        if let Some(cmd) = self.configuring("progress") {
            cmd.progress = Some(progress);
        }
        self
    }

    // ========================================================================
    // Runtime surface
    // ========================================================================

    /// Writable stdin. First call wires a streamed stdin into the command;
    /// it must happen before the process spawns to take effect. The child
    /// sees EOF once every returned handle has been dropped or closed.
    pub fn stdin(&mut self) -> StdinHandle {
        if let Some(weak) = &self.stdin {
            if let Some(tx) = weak.upgrade() {
                return StdinHandle { tx };
            }
            // All handles were closed already; hand back a dead one.
            let (tx, _) = mpsc::channel::<Bytes>(1);
            return StdinHandle { tx };
        }

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        self.stdin = Some(tx.downgrade());

        if let PromiseState::Configuring(cmd) = &mut self.state {
            let stream =
                tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
            let reader = tokio_util::io::StreamReader::new(stream);
            cmd.stdin = StdinSource::Reader(Arc::new(parking_lot::Mutex::new(Some(Box::new(
                reader,
            )))));
        } else {
            warn!("stdin() wired after spawn has no effect");
        }
        StdinHandle { tx }
    }

    /// Deliver a signal to the running child.
    pub fn kill(&self, signal: impl Into<String>) {
        self.kill.send(signal);
    }

    /// Start execution without waiting for settlement.
    pub fn spawn(mut self) -> Self {
        self.ensure_spawned();
        self
    }

    fn ensure_spawned(&mut self) {
        if let PromiseState::Configuring(_) = self.state {
            let PromiseState::Configuring(cmd) =
                std::mem::replace(&mut self.state, PromiseState::Settled(Err(Arc::new(
                    Error::Validation("promise state poisoned during spawn".to_string()),
                ))))
            else {
                unreachable!()
            };

            let engine = self.engine.clone();
            let handle = tokio::spawn(async move { engine.dispatch(*cmd).await });
            self.state = PromiseState::Spawned(handle);
        }
    }

    /// Await settlement. Later calls return the same outcome.
    pub async fn wait(&mut self) -> Result<ExecutionResult> {
        self.ensure_spawned();

        if let PromiseState::Spawned(_) = &self.state {
            let PromiseState::Spawned(handle) =
                std::mem::replace(&mut self.state, PromiseState::Settled(Err(Arc::new(
                    Error::Validation("promise state poisoned during wait".to_string()),
                ))))
            else {
                unreachable!()
            };

            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(Error::Cancelled {
                    command: format!("task failed: {}", join_error),
                    partial: None,
                }),
            };

            // A pipeline's upstream tasks settle with the terminal one.
            for predecessor in self.predecessors.drain(..) {
                let _ = predecessor.await;
            }

            self.state = PromiseState::Settled(outcome.map_err(Arc::new));
        }

        match &self.state {
            PromiseState::Settled(Ok(result)) => Ok(result.clone()),
            PromiseState::Settled(Err(error)) => Err(error.duplicate()),
            _ => unreachable!("wait always settles"),
        }
    }

    // ========================================================================
    // Piping
    // ========================================================================

    /// Connect this process's stdout to `next`'s stdin. Returns the
    /// downstream promise; its result is the pipeline's result.
    /// Cancellation propagates: both ends share a token.
    pub fn pipe(mut self, mut next: ProcessPromise) -> ProcessPromise {
        let (read_half, write_half) = tokio::io::duplex(64 * 1024);

        // Share one cancellation token across the pipeline.
        let token = match &self.state {
            PromiseState::Configuring(cmd) => cmd.cancel.clone(),
            _ => None,
        }
        .unwrap_or_default();

        if let Some(cmd) = self.configuring("pipe") {
            cmd.stdout = crate::command::OutputSink::Writer(Arc::new(parking_lot::Mutex::new(
                Some(Box::new(write_half)),
            )));
            cmd.cancel = Some(token.clone());
        }
        if let Some(cmd) = next.configuring("pipe-stdin") {
            cmd.stdin = StdinSource::Reader(Arc::new(parking_lot::Mutex::new(Some(Box::new(
                read_half,
            )))));
            cmd.cancel = Some(token);
        }

        // Upstream failures surface as EOF downstream; the upstream task
        // itself is joined when the pipeline settles.
        self.ensure_spawned();
        if let PromiseState::Spawned(handle) =
            std::mem::replace(&mut self.state, PromiseState::Settled(Err(Arc::new(
                Error::Validation("pipeline upstream detached".to_string()),
            ))))
        {
            next.predecessors.push(handle);
        }
        next.predecessors.extend(self.predecessors.drain(..));

        next
    }

    /// Pipe into a byte sink instead of another process.
    pub fn pipe_to_writer(
        mut self,
        writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    ) -> Self {
        if let Some(cmd) = self.configuring("pipe_to_writer") {
            cmd.stdout =
                crate::command::OutputSink::Writer(Arc::new(parking_lot::Mutex::new(Some(writer))));
        }
        self
    }

    // ========================================================================
    // Decoders
    // ========================================================================

    /// Settlement plus strict UTF-8 decode of stdout.
    pub async fn text(&mut self) -> Result<String> {
        self.wait().await?.text()
    }

    /// Settlement plus JSON parse of stdout.
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        self.wait().await?.json()
    }

    /// Settlement plus line split of stdout.
    pub async fn lines(&mut self) -> Result<Vec<String>> {
        self.wait().await?.lines()
    }

    /// Settlement plus raw stdout bytes.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        Ok(self.wait().await?.bytes())
    }
}
