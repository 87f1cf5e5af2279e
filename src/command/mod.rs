//! Command values
//!
//! A [`Command`] is the input to the engine: program or shell line, env,
//! working directory, stdio wiring, timeout, retry/cache policy and the
//! target it runs against. Commands are plain values; spawning happens in
//! the engine.

mod template;
pub mod target;

pub use target::{
    AdapterKind, AuthMethod, ContainerConfig, DockerOptions, Healthcheck, KeyMaterial,
    KubernetesOptions, PasswordMethod, RemoteDockerOptions, RestartPolicy, SshOptions, SudoConfig,
    Target, VolumeSpec,
};
pub use template::{interpolate, interpolate_raw, quote, CommandTemplate};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::exec::cache::CachePolicy;
use crate::exec::retry::RetryPolicy;

/// Shell interpretation mode for a command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Shell {
    /// Program + args are exec'd directly.
    Off,
    /// Platform default (`/bin/sh -c` on Unix).
    #[default]
    Default,
    /// Explicit interpreter path.
    Path(PathBuf),
}

impl Shell {
    /// Interpreter program for a shell line, if one is active.
    pub fn program(&self) -> Option<String> {
        match self {
            Shell::Off => None,
            Shell::Default => Some("/bin/sh".to_string()),
            Shell::Path(path) => Some(path.to_string_lossy().into_owned()),
        }
    }
}

/// A boxed async reader shared between clones of a command.
///
/// The reader is consumed by the first execution attempt; retries see an
/// empty stdin.
pub type SharedReader = Arc<Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>>;

/// A boxed async writer shared between clones of a command.
pub type SharedWriter = Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// What the child process reads on stdin.
#[derive(Clone, Default)]
pub enum StdinSource {
    /// No stdin (closed immediately).
    #[default]
    Null,
    /// Fixed bytes written then EOF.
    Bytes(Bytes),
    /// Streamed from an async reader.
    Reader(SharedReader),
    /// Inherit the parent's stdin.
    Inherit,
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinSource::Null => write!(f, "Null"),
            StdinSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            StdinSource::Reader(_) => write!(f, "Reader"),
            StdinSource::Inherit => write!(f, "Inherit"),
        }
    }
}

/// Where a child stream (stdout or stderr) goes.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// Capture into the result.
    #[default]
    Pipe,
    /// Discard.
    Ignore,
    /// Inherit the parent's stream.
    Inherit,
    /// Stream into an external writer (still captured into the result).
    Writer(SharedWriter),
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Pipe => write!(f, "Pipe"),
            OutputSink::Ignore => write!(f, "Ignore"),
            OutputSink::Inherit => write!(f, "Inherit"),
            OutputSink::Writer(_) => write!(f, "Writer"),
        }
    }
}

/// Periodic progress snapshot delivered to a progress callback.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub bytes_stdout: u64,
    pub bytes_stderr: u64,
    pub lines_stdout: u64,
    pub elapsed: Duration,
    /// Most recent stdout line, when line reporting is on.
    pub last_line: Option<String>,
}

/// Progress reporting configuration.
#[derive(Clone, Default)]
pub struct ProgressConfig {
    pub enabled: bool,
    /// Snapshot cadence; zero means every line/chunk.
    pub interval: Duration,
    pub report_lines: bool,
    pub callback: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
}

impl std::fmt::Debug for ProgressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressConfig")
            .field("enabled", &self.enabled)
            .field("interval", &self.interval)
            .field("report_lines", &self.report_lines)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Default grace period between the timeout signal and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Out-of-band signal channel from a [`ProcessPromise`] to the adapter
/// driving its child.
///
/// Signals sent before the adapter registers are buffered; the adapter
/// drains them on registration.
///
/// [`ProcessPromise`]: crate::exec::ProcessPromise
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Mutex<KillInner>>,
}

#[derive(Default)]
struct KillInner {
    tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    pending: Vec<String>,
}

impl KillSwitch {
    /// Called by the adapter that owns the child. Only one registration is
    /// live at a time; a retry attempt re-registers.
    pub fn register(&self) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for signal in inner.pending.drain(..) {
            let _ = tx.send(signal);
        }
        inner.tx = Some(tx);
        rx
    }

    /// Request signal delivery to the running child.
    pub fn send(&self, signal: impl Into<String>) {
        let signal = signal.into();
        let mut inner = self.inner.lock();
        match &inner.tx {
            Some(tx) if tx.send(signal.clone()).is_ok() => {}
            _ => inner.pending.push(signal),
        }
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KillSwitch")
    }
}

/// Input to the engine: one command invocation.
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to exec. Mutually exclusive with `shell_line`.
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Whole line interpreted by `shell`. Mutually exclusive with `program`.
    pub shell_line: Option<String>,
    pub shell: Shell,
    pub cwd: Option<PathBuf>,
    /// `None` inherits the ambient environment; `Some` (even empty)
    /// replaces it entirely.
    pub env: Option<BTreeMap<String, String>>,
    /// Additive variables layered over the ambient (or explicit) env.
    /// Context frames merge in here; explicit `env` keys win.
    pub env_extra: BTreeMap<String, String>,
    pub stdin: StdinSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    pub timeout: Option<Duration>,
    /// POSIX signal name delivered on timeout.
    pub timeout_signal: String,
    /// How long after the timeout signal before escalating to SIGKILL.
    pub kill_grace: Duration,
    pub cancel: Option<CancellationToken>,
    /// Report non-zero exits as settled results instead of errors.
    pub nothrow: bool,
    pub quiet: bool,
    /// Allocate a TTY and inherit stdio.
    pub interactive: bool,
    pub retry: Option<RetryPolicy>,
    pub cache: Option<CachePolicy>,
    pub target: Target,
    pub progress: Option<ProgressConfig>,
    /// Signal channel serviced by the adapter while the child runs.
    pub kill: KillSwitch,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            shell_line: None,
            shell: Shell::Default,
            cwd: None,
            env: None,
            env_extra: BTreeMap::new(),
            stdin: StdinSource::Null,
            stdout: OutputSink::Pipe,
            stderr: OutputSink::Pipe,
            timeout: None,
            timeout_signal: "SIGTERM".to_string(),
            kill_grace: DEFAULT_KILL_GRACE,
            cancel: None,
            nothrow: false,
            quiet: false,
            interactive: false,
            retry: None,
            cache: None,
            target: Target::Auto,
            progress: None,
            kill: KillSwitch::default(),
        }
    }
}

impl Command {
    /// Command from a program and argument list, no shell.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            shell: Shell::Off,
            ..Default::default()
        }
    }

    /// Command from a shell line, interpreted by the default shell.
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            shell_line: Some(line.into()),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set a single environment variable, replacing any previous value.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the whole environment. Duplicate keys in the input are a
    /// validation error.
    pub fn envs<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in vars {
            let key = key.into();
            if map.insert(key.clone(), value.into()).is_some() {
                return Err(Error::Validation(format!(
                    "duplicate environment key: {}",
                    key
                )));
            }
        }
        self.env = Some(map);
        Ok(self)
    }

    /// Use an explicitly empty environment (nothing inherited).
    pub fn env_clear(mut self) -> Self {
        self.env = Some(BTreeMap::new());
        self
    }

    pub fn stdin_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.stdin = StdinSource::Bytes(bytes.into());
        self
    }

    pub fn stdin_reader(mut self, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        self.stdin = StdinSource::Reader(Arc::new(Mutex::new(Some(reader))));
        self
    }

    pub fn stdout_writer(mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.stdout = OutputSink::Writer(Arc::new(Mutex::new(Some(writer))));
        self
    }

    pub fn stderr_writer(mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.stderr = OutputSink::Writer(Arc::new(Mutex::new(Some(writer))));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_signal(mut self, signal: impl Into<String>) -> Self {
        self.timeout_signal = signal.into();
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// TTY allocation plus inherited stdio.
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self.stdin = StdinSource::Inherit;
        self.stdout = OutputSink::Inherit;
        self.stderr = OutputSink::Inherit;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Check the structural invariants of the command.
    pub fn validate(&self) -> Result<()> {
        match (&self.program, &self.shell_line) {
            (Some(_), Some(_)) => {
                return Err(Error::Validation(
                    "command cannot set both program and shell_line".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Validation(
                    "command needs a program or a shell_line".to_string(),
                ))
            }
            (Some(program), None) if program.is_empty() => {
                return Err(Error::Validation("program is empty".to_string()))
            }
            _ => {}
        }

        if self.shell_line.is_some() && self.shell == Shell::Off {
            return Err(Error::Validation(
                "shell_line requires an active shell".to_string(),
            ));
        }

        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(Error::Validation(
                    "timeout of zero is not a valid timer; use no timeout instead".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Additive + explicit env merged, explicit keys winning. This is the
    /// variable set adapters apply on top of whatever the target inherits.
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut merged = self.env_extra.clone();
        if let Some(env) = &self.env {
            for (key, value) in env {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Rendered command string for events and results.
    pub fn display_string(&self) -> String {
        if let Some(line) = &self.shell_line {
            line.clone()
        } else {
            let mut parts = Vec::with_capacity(1 + self.args.len());
            if let Some(program) = &self.program {
                parts.push(program.clone());
            }
            parts.extend(self.args.iter().cloned());
            shell_words::join(parts.iter().map(String::as_str))
        }
    }

    /// Program + args vector with any shell line resolved through the
    /// configured interpreter.
    pub fn argv(&self) -> Result<Vec<String>> {
        if let Some(line) = &self.shell_line {
            let interpreter = self.shell.program().ok_or_else(|| {
                Error::Validation("shell_line requires an active shell".to_string())
            })?;
            Ok(vec![interpreter, "-c".to_string(), line.clone()])
        } else {
            let program = self
                .program
                .clone()
                .ok_or_else(|| Error::Validation("command has no program".to_string()))?;
            let mut argv = vec![program];
            argv.extend(self.args.iter().cloned());
            Ok(argv)
        }
    }

    /// The cancellation token, creating a fresh detached one when unset.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone().unwrap_or_default()
    }
}
