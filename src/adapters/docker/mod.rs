//! Docker adapter
//!
//! Two modes behind one target: `exec` runs in an existing container,
//! `run` creates an ephemeral one for the single command and removes it on
//! settlement. The adapter drives the local `docker` binary; lifecycle
//! operations live on [`ContainerHandle`].

mod cli;
mod container;
mod network;

pub use container::{ContainerHandle, LogOptions, LogStreamHandle};
pub use network::{NetworkConfig, VolumeConfig};

pub(crate) use cli::{Cli, CliOutput};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;

use super::local::LocalAdapter;
use super::{Adapter, Capabilities};
use crate::command::{
    AdapterKind, Command, ContainerConfig, DockerOptions, Shell, StdinSource, Target,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};
use crate::exec::ExecutionResult;

/// Container names the CLI will accept.
fn name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid regex"))
}

/// Reject empty, path-like or shell-metacharacter container names.
pub fn validate_container_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid container name: {:?}",
            name
        )))
    }
}

/// Which execution path a target resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Exec in an existing container.
    Exec(String),
    /// Run an ephemeral container from an image.
    Run(String),
}

pub(crate) fn resolve_mode(opts: &DockerOptions) -> Result<Mode> {
    match (&opts.container, &opts.image) {
        // Container wins when both are present.
        (Some(container), _) => {
            validate_container_name(container)?;
            Ok(Mode::Exec(container.clone()))
        }
        (None, Some(image)) => Ok(Mode::Run(image.clone())),
        (None, None) => Err(Error::Validation(
            "docker target needs a container or an image".to_string(),
        )),
    }
}

/// Adapter executing commands through the `docker` CLI.
pub struct DockerAdapter {
    cli: Cli,
    local: LocalAdapter,
    bus: Arc<EventBus>,
    disposed: AtomicBool,
}

impl DockerAdapter {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_binary("docker", bus)
    }

    pub fn with_binary(binary: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            cli: Cli::new(binary),
            local: LocalAdapter::new(),
            bus,
            disposed: AtomicBool::new(false),
        }
    }

    fn options_of(cmd: &Command) -> Result<DockerOptions> {
        match &cmd.target {
            Target::Docker(opts) => Ok(opts.clone()),
            other => Err(Error::Validation(format!(
                "docker adapter cannot execute a {:?} target",
                other.kind()
            ))),
        }
    }

    /// Command argv inside the container.
    fn container_argv(cmd: &Command) -> Result<Vec<String>> {
        if let Some(line) = &cmd.shell_line {
            let shell = match &cmd.shell {
                Shell::Path(path) => path.to_string_lossy().into_owned(),
                _ => "/bin/sh".to_string(),
            };
            Ok(vec![shell, "-c".to_string(), line.clone()])
        } else {
            let mut argv = vec![cmd
                .program
                .clone()
                .ok_or_else(|| Error::Validation("command has no program".to_string()))?];
            argv.extend(cmd.args.iter().cloned());
            Ok(argv)
        }
    }

    /// Effective env: command env wins over adapter defaults.
    fn effective_env(cmd: &Command, opts: &DockerOptions) -> Vec<(String, String)> {
        let command_env = cmd.merged_env();
        let mut env: Vec<(String, String)> = opts
            .default_env
            .iter()
            .filter(|(key, _)| !command_env.contains_key(key))
            .cloned()
            .collect();
        env.extend(command_env);
        env
    }

    pub(crate) fn exec_args(cmd: &Command, opts: &DockerOptions, container: &str) -> Result<Vec<String>> {
        let mut args = vec!["exec".to_string()];

        if cmd.interactive || !matches!(cmd.stdin, StdinSource::Null) {
            args.push("-i".to_string());
        }
        if opts.tty || cmd.interactive {
            args.push("-t".to_string());
        }
        if let Some(user) = &opts.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        let workdir = cmd
            .cwd
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .or_else(|| opts.workdir.clone());
        if let Some(workdir) = workdir {
            args.push("-w".to_string());
            args.push(workdir);
        }
        for (key, value) in Self::effective_env(cmd, opts) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(container.to_string());
        args.extend(Self::container_argv(cmd)?);
        Ok(args)
    }

    pub(crate) fn run_args(
        cmd: &Command,
        opts: &DockerOptions,
        image: &str,
        name: &str,
    ) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string()];
        let config = &opts.config;

        if opts.auto_remove {
            args.push("--rm".to_string());
        }
        args.push("--name".to_string());
        args.push(name.to_string());

        if cmd.interactive || !matches!(cmd.stdin, StdinSource::Null) {
            args.push("-i".to_string());
        }
        if opts.tty || cmd.interactive {
            args.push("-t".to_string());
        }

        if let Some(entrypoint) = &config.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }
        if let Some(env_file) = &config.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.to_string_lossy().into_owned());
        }
        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in Self::effective_env(cmd, opts) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &config.volumes {
            args.push("-v".to_string());
            args.push(volume.as_flag());
        }
        for port in &config.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        if let Some(network) = &config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(hostname) = &config.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }
        if let Some(user) = config.user.as_ref().or(opts.user.as_ref()) {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        let workdir = cmd
            .cwd
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .or_else(|| config.workdir.clone())
            .or_else(|| opts.workdir.clone());
        if let Some(workdir) = workdir {
            args.push("-w".to_string());
            args.push(workdir);
        }
        if let Some(memory) = &config.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(cpus) = config.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        for cap in &config.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        for cap in &config.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        if config.restart != crate::command::RestartPolicy::No {
            args.push("--restart".to_string());
            args.push(config.restart.as_flag().to_string());
        }
        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(health) = &config.healthcheck {
            args.push("--health-cmd".to_string());
            args.push(health.test.clone());
            args.push("--health-interval".to_string());
            args.push(format!("{}s", health.interval.as_secs().max(1)));
            args.push("--health-timeout".to_string());
            args.push(format!("{}s", health.timeout.as_secs().max(1)));
            args.push("--health-retries".to_string());
            args.push(health.retries.to_string());
            args.push("--health-start-period".to_string());
            args.push(format!("{}s", health.start_period.as_secs()));
        }
        if config.privileged {
            args.push("--privileged".to_string());
        }

        args.push(image.to_string());
        args.extend(Self::container_argv(cmd)?);
        Ok(args)
    }

    /// Dispatch the docker CLI through the local adapter so timeout,
    /// cancellation, kill and stream sinks behave exactly as for local
    /// commands.
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

    fn annotate(result: &mut ExecutionResult, cmd: &Command, container: Option<&str>) {
        result.adapter = AdapterKind::Docker;
        result.command = cmd.display_string();
        result.container = container.map(str::to_string);
    }

    fn annotate_outcome(
        outcome: Result<ExecutionResult>,
        cmd: &Command,
        container: Option<&str>,
    ) -> Result<ExecutionResult> {
        match outcome {
            Ok(mut result) => {
                Self::annotate(&mut result, cmd, container);
                Ok(result)
            }
            Err(Error::Timeout {
                command: _,
                timeout,
                partial,
            }) => Err(Error::Timeout {
                command: cmd.display_string(),
                timeout,
                partial: partial.map(|mut r| {
                    Self::annotate(&mut r, cmd, container);
                    r
                }),
            }),
            Err(Error::Cancelled { partial, .. }) => Err(Error::Cancelled {
                command: cmd.display_string(),
                partial: partial.map(|mut r| {
                    Self::annotate(&mut r, cmd, container);
                    r
                }),
            }),
            Err(Error::ProgramNotFound { .. }) => Err(Error::AdapterUnavailable(
                "docker binary not found".to_string(),
            )),
            Err(other) => Err(other),
        }
    }

    // ========================================================================
    // Managed containers
    // ========================================================================

    /// Handle to an existing container.
    pub fn container(&self, name: impl Into<String>) -> Result<ContainerHandle> {
        let name = name.into();
        validate_container_name(&name)?;
        Ok(ContainerHandle::new(
            name,
            self.cli.clone(),
            self.bus.clone(),
        ))
    }

    /// Create and start a container from `image`; the returned handle owns
    /// its lifetime unless `auto_remove` was set in the config.
    pub async fn start_container(
        &self,
        image: &str,
        name: Option<&str>,
        config: &ContainerConfig,
    ) -> Result<ContainerHandle> {
        let name = match name {
            Some(name) => {
                validate_container_name(name)?;
                name.to_string()
            }
            None => ephemeral_name(),
        };

        let opts = DockerOptions {
            container: None,
            image: Some(image.to_string()),
            config: config.clone(),
            auto_remove: false,
            ..Default::default()
        };
        // `run -d` wants no command-level stdio, so build a bare command.
        let probe = Command::new("true").target(Target::Docker(opts.clone()));
        let mut args = Self::run_args(&probe, &opts, image, &name)?;
        // Replace `run` argv tail ("true") with detached startup.
        args.truncate(args.len() - 1);
        args.insert(1, "-d".to_string());

        self.cli.run_checked(&name, &args).await?;

        self.bus.emit(
            AdapterKind::Docker,
            EventPayload::DockerRun {
                image: image.to_string(),
                container: Some(name.clone()),
                command: None,
            },
        );

        Ok(ContainerHandle::new(
            name,
            self.cli.clone(),
            self.bus.clone(),
        ))
    }

    // ========================================================================
    // Networks and volumes
    // ========================================================================

    pub async fn create_network(&self, name: &str, config: &NetworkConfig) -> Result<()> {
        network::create_network(&self.cli, name, config).await
    }

    pub async fn remove_network(&self, name: &str) -> Result<()> {
        network::remove_network(&self.cli, name).await
    }

    pub async fn list_networks(&self) -> Result<Vec<String>> {
        network::list_networks(&self.cli).await
    }

    pub async fn inspect_network(&self, name: &str) -> Result<serde_json::Value> {
        network::inspect_network(&self.cli, name).await
    }

    pub async fn create_volume(&self, name: &str, config: &VolumeConfig) -> Result<()> {
        network::create_volume(&self.cli, name, config).await
    }

    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        network::remove_volume(&self.cli, name, force).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<String>> {
        network::list_volumes(&self.cli).await
    }

    pub async fn inspect_volume(&self, name: &str) -> Result<serde_json::Value> {
        network::inspect_volume(&self.cli, name).await
    }
}

/// Generated name for ephemeral containers.
pub(crate) fn ephemeral_name() -> String {
    format!("uxec-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Docker
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tty: true,
            transfer: true,
            tunnel: false,
            port_forward: false,
            health: true,
        }
    }

    async fn execute(&self, cmd: Command) -> Result<ExecutionResult> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("docker adapter".to_string()));
        }
        cmd.validate()?;
        let opts = Self::options_of(&cmd)?;

        match resolve_mode(&opts)? {
            Mode::Exec(container) => {
                let args = Self::exec_args(&cmd, &opts, &container)?;
                self.bus.emit(
                    AdapterKind::Docker,
                    EventPayload::DockerExec {
                        container: container.clone(),
                        command: cmd.display_string(),
                    },
                );
                let outcome = self.run_cli_command(&cmd, args).await;
                Self::annotate_outcome(outcome, &cmd, Some(&container))
            }
            Mode::Run(image) => {
                let name = opts
                    .config
                    .name
                    .clone()
                    .unwrap_or_else(ephemeral_name);
                validate_container_name(&name)?;
                let args = Self::run_args(&cmd, &opts, &image, &name)?;
                self.bus.emit(
                    AdapterKind::Docker,
                    EventPayload::DockerRun {
                        image: image.clone(),
                        container: Some(name.clone()),
                        command: Some(cmd.display_string()),
                    },
                );
                let outcome = self.run_cli_command(&cmd, args).await;

                // With --rm docker cleans up; otherwise an ephemeral run
                // that was not flagged auto_remove is the caller's to keep.
                Self::annotate_outcome(outcome, &cmd, Some(&name))
            }
        }
    }

    async fn is_available(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.cli.available().await
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_container_name("web-1").is_ok());
        assert!(validate_container_name("App.stage_2").is_ok());

        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("..").is_err());
        assert!(validate_container_name("-leading").is_err());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name("a;rm -rf /").is_err());
        assert!(validate_container_name("a/b").is_err());
        assert!(validate_container_name("$(evil)").is_err());
    }

    #[test]
    fn test_mode_container_wins() {
        let opts = DockerOptions {
            container: Some("web".into()),
            image: Some("alpine".into()),
            ..Default::default()
        };
        assert_eq!(resolve_mode(&opts).unwrap(), Mode::Exec("web".into()));

        let opts = DockerOptions::image("alpine");
        assert_eq!(resolve_mode(&opts).unwrap(), Mode::Run("alpine".into()));

        let opts = DockerOptions::default();
        assert!(resolve_mode(&opts).is_err());
    }

    #[test]
    fn test_exec_args_shape() {
        let cmd = Command::new("ls").arg("-la").env("FOO", "bar").cwd("/srv");
        let opts = DockerOptions {
            container: Some("web".into()),
            user: Some("app".into()),
            ..Default::default()
        };
        let args = DockerAdapter::exec_args(&cmd, &opts, "web").unwrap();
        assert_eq!(
            args,
            vec![
                "exec", "-u", "app", "-w", "/srv", "-e", "FOO=bar", "web", "ls", "-la"
            ]
        );
    }

    #[test]
    fn test_exec_args_stdin_adds_interactive_flag() {
        let cmd = Command::new("cat").stdin_bytes(&b"data"[..]);
        let opts = DockerOptions::container("web");
        let args = DockerAdapter::exec_args(&cmd, &opts, "web").unwrap();
        assert_eq!(args[1], "-i");
    }

    #[test]
    fn test_env_precedence_command_over_adapter() {
        let cmd = Command::new("env").env("SHARED", "from-command");
        let opts = DockerOptions {
            container: Some("web".into()),
            default_env: vec![
                ("SHARED".into(), "from-adapter".into()),
                ("ONLY_ADAPTER".into(), "x".into()),
            ],
            ..Default::default()
        };
        let env = DockerAdapter::effective_env(&cmd, &opts);
        assert!(env.contains(&("ONLY_ADAPTER".into(), "x".into())));
        assert!(env.contains(&("SHARED".into(), "from-command".into())));
        assert!(!env.contains(&("SHARED".into(), "from-adapter".into())));
    }

    #[test]
    fn test_run_args_full_config() {
        use crate::command::{RestartPolicy, VolumeSpec};
        use std::time::Duration;

        let cmd = Command::shell("echo x");
        let opts = DockerOptions {
            image: Some("alpine:3.20".into()),
            auto_remove: true,
            config: ContainerConfig {
                env: vec![("MODE".into(), "test".into())],
                volumes: vec![VolumeSpec {
                    source: "/data".into(),
                    target: "/mnt".into(),
                    read_only: true,
                }],
                ports: vec!["8080:80".into()],
                network: Some("backend".into()),
                memory: Some("512m".into()),
                cpus: Some(1.5),
                restart: RestartPolicy::OnFailure,
                labels: vec![("app".into(), "uxec".into())],
                healthcheck: Some(crate::command::Healthcheck {
                    test: "wget -q localhost".into(),
                    interval: Duration::from_secs(5),
                    timeout: Duration::from_secs(2),
                    retries: 3,
                    start_period: Duration::from_secs(0),
                }),
                privileged: false,
                ..Default::default()
            },
            ..Default::default()
        };

        let args = DockerAdapter::run_args(&cmd, &opts, "alpine:3.20", "uxec-test").unwrap();
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --name uxec-test"));
        assert!(joined.contains("-e MODE=test"));
        assert!(joined.contains("-v /data:/mnt:ro"));
        assert!(joined.contains("-p 8080:80"));
        assert!(joined.contains("--network backend"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--restart on-failure"));
        assert!(joined.contains("--label app=uxec"));
        assert!(joined.contains("--health-cmd"));
        assert!(joined.ends_with("alpine:3.20 /bin/sh -c echo x"));
    }

    #[test]
    fn test_ephemeral_name_is_valid() {
        let name = ephemeral_name();
        assert!(validate_container_name(&name).is_ok());
        assert!(name.starts_with("uxec-"));
    }
}
