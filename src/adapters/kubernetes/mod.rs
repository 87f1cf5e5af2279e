//! Kubernetes adapter
//!
//! Drives the `kubectl` binary: exec in a pod (optionally by label
//! selector), log capture and following, static/dynamic port-forwards and
//! file copy via `kubectl cp`.

mod forward;
mod logs;

pub use forward::PortForwardHandle;
pub use logs::{K8sLogOptions, K8sLogStreamHandle};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::docker::Cli;
use super::local::LocalAdapter;
use super::{Adapter, Capabilities};
use crate::command::{AdapterKind, Command, KubernetesOptions, Shell, StdinSource, Target};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};
use crate::exec::ExecutionResult;

/// Adapter executing commands through `kubectl`.
pub struct KubernetesAdapter {
    cli: Cli,
    local: LocalAdapter,
    bus: Arc<EventBus>,
    disposed: AtomicBool,
}

impl KubernetesAdapter {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_binary("kubectl", bus)
    }

    pub fn with_binary(binary: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            cli: Cli::new(binary),
            local: LocalAdapter::new(),
            bus,
            disposed: AtomicBool::new(false),
        }
    }

    fn options_of(cmd: &Command) -> Result<KubernetesOptions> {
        match &cmd.target {
            Target::Kubernetes(opts) => Ok(opts.clone()),
            other => Err(Error::Validation(format!(
                "kubernetes adapter cannot execute a {:?} target",
                other.kind()
            ))),
        }
    }

    /// Global flags shared by every kubectl invocation for a target.
    pub(crate) fn global_flags(opts: &KubernetesOptions) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(kubeconfig) = &opts.kubeconfig {
            flags.push("--kubeconfig".to_string());
            flags.push(kubeconfig.to_string_lossy().into_owned());
        }
        if let Some(context) = &opts.context {
            flags.push("--context".to_string());
            flags.push(context.clone());
        }
        flags
    }

    /// Pod selector args: a plain name, or `-l <selector>` when the pod
    /// field carries the label prefix.
    pub(crate) fn pod_args(opts: &KubernetesOptions) -> Vec<String> {
        match opts.pod.strip_prefix("-l ") {
            Some(selector) => vec!["-l".to_string(), selector.to_string()],
            None => vec![opts.pod.clone()],
        }
    }

    fn exec_args(cmd: &Command, opts: &KubernetesOptions) -> Result<Vec<String>> {
        let mut args = Self::global_flags(opts);
        args.push("exec".to_string());
        args.push("-n".to_string());
        args.push(opts.namespace.clone());

        if opts.stdin || cmd.interactive || !matches!(cmd.stdin, StdinSource::Null) {
            args.push("-i".to_string());
        }
        if opts.tty || cmd.interactive {
            args.push("-t".to_string());
        }
        args.extend(opts.exec_flags.iter().cloned());
        args.extend(Self::pod_args(opts));
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.push("--".to_string());

        // Env and cwd have no kubectl flags; they are inlined into a shell
        // line inside the pod.
        let needs_shell = cmd.shell_line.is_some()
            || !cmd.merged_env().is_empty()
            || cmd.cwd.is_some();
        if needs_shell {
            let line = crate::adapters::ssh::build_remote_line(cmd, None)?;
            let shell = match &cmd.shell {
                Shell::Path(path) => path.to_string_lossy().into_owned(),
                _ => "/bin/sh".to_string(),
            };
            args.push(shell);
            args.push("-c".to_string());
            args.push(line.wire);
        } else {
            args.push(
                cmd.program
                    .clone()
                    .ok_or_else(|| Error::Validation("command has no program".to_string()))?,
            );
            args.extend(cmd.args.iter().cloned());
        }
        Ok(args)
    }

    async fn run_cli_command(&self, cmd: &Command, args: Vec<String>) -> Result<ExecutionResult> {
        let local_cmd = Command {
            program: Some(self.cli.binary().to_string()),
            args,
            shell_line: None,
            shell: Shell::Off,
            cwd: None,
            env: None,
            env_extra: Default::default(),
            stdin: cmd.stdin.clone(),
            stdout: cmd.stdout.clone(),
            stderr: cmd.stderr.clone(),
            timeout: cmd.timeout,
            timeout_signal: cmd.timeout_signal.clone(),
            kill_grace: cmd.kill_grace,
            cancel: cmd.cancel.clone(),
            nothrow: false,
            quiet: cmd.quiet,
            interactive: cmd.interactive,
            retry: None,
            cache: None,
            target: Target::Local,
            progress: cmd.progress.clone(),
            kill: cmd.kill.clone(),
        };
        self.local.execute(local_cmd).await
    }

    fn annotate_outcome(
        outcome: Result<ExecutionResult>,
        cmd: &Command,
        opts: &KubernetesOptions,
    ) -> Result<ExecutionResult> {
        let annotate = |result: &mut ExecutionResult| {
            result.adapter = AdapterKind::Kubernetes;
            result.command = cmd.display_string();
            result.pod = Some(opts.pod.clone());
        };
        match outcome {
            Ok(mut result) => {
                annotate(&mut result);
                Ok(result)
            }
            Err(Error::Timeout {
                timeout, partial, ..
            }) => Err(Error::Timeout {
                command: cmd.display_string(),
                timeout,
                partial: partial.map(|mut r| {
                    annotate(&mut r);
                    r
                }),
            }),
            Err(Error::Cancelled { partial, .. }) => Err(Error::Cancelled {
                command: cmd.display_string(),
                partial: partial.map(|mut r| {
                    annotate(&mut r);
                    r
                }),
            }),
            Err(Error::ProgramNotFound { .. }) => Err(Error::AdapterUnavailable(
                "kubectl binary not found".to_string(),
            )),
            Err(other) => Err(other),
        }
    }

    // ========================================================================
    // Logs
    // ========================================================================

    /// Whole captured log output per the options.
    pub async fn logs(&self, opts: &KubernetesOptions, options: &K8sLogOptions) -> Result<String> {
        logs::fetch(&self.cli, opts, options).await
    }

    /// Follow logs with a line callback; the handle supports stop, pause
    /// and resume.
    pub async fn stream_logs<F>(
        &self,
        opts: &KubernetesOptions,
        options: &K8sLogOptions,
        callback: F,
    ) -> Result<K8sLogStreamHandle>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        logs::stream(&self.cli, opts, options, callback).await
    }

    // ========================================================================
    // Port forward
    // ========================================================================

    /// Forward `local_port` (zero for an OS-assigned pick) to
    /// `remote_port` on the pod.
    pub async fn port_forward(
        &self,
        opts: &KubernetesOptions,
        local_port: u16,
        remote_port: u16,
    ) -> Result<PortForwardHandle> {
        forward::open(&self.cli, opts, local_port, remote_port).await
    }

    // ========================================================================
    // File copy
    // ========================================================================

    pub async fn cp_to(
        &self,
        opts: &KubernetesOptions,
        local: &Path,
        pod_path: &str,
    ) -> Result<()> {
        let mut args = Self::global_flags(opts);
        args.push("cp".to_string());
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.push(local.to_string_lossy().into_owned());
        args.push(format!("{}/{}:{}", opts.namespace, opts.pod, pod_path));

        self.cli
            .run_checked(&opts.pod, &args)
            .await
            .map_err(|e| Error::Transfer {
                direction: crate::error::TransferDirection::Upload,
                source_path: local.display().to_string(),
                destination: format!("{}:{}", opts.pod, pod_path),
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn cp_from(
        &self,
        opts: &KubernetesOptions,
        pod_path: &str,
        local: &Path,
    ) -> Result<()> {
        let mut args = Self::global_flags(opts);
        args.push("cp".to_string());
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.push(format!("{}/{}:{}", opts.namespace, opts.pod, pod_path));
        args.push(local.to_string_lossy().into_owned());

        self.cli
            .run_checked(&opts.pod, &args)
            .await
            .map_err(|e| Error::Transfer {
                direction: crate::error::TransferDirection::Download,
                source_path: format!("{}:{}", opts.pod, pod_path),
                destination: local.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Kubernetes
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tty: true,
            transfer: true,
            tunnel: false,
            port_forward: true,
            health: false,
        }
    }

    async fn execute(&self, cmd: Command) -> Result<ExecutionResult> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("kubernetes adapter".to_string()));
        }
        cmd.validate()?;
        let opts = Self::options_of(&cmd)?;

        let args = Self::exec_args(&cmd, &opts)?;
        self.bus.emit(
            AdapterKind::Kubernetes,
            EventPayload::K8sExec {
                pod: opts.pod.clone(),
                namespace: Some(opts.namespace.clone()),
                container: opts.container.clone(),
                command: cmd.display_string(),
            },
        );

        let outcome = self.run_cli_command(&cmd, args).await;
        Self::annotate_outcome(outcome, &cmd, &opts)
    }

    async fn is_available(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        matches!(self.cli.run(["version", "--client"]).await, Ok(out) if out.ok())
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
