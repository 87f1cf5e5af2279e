//! Remote-docker adapter
//!
//! Composition of the SSH and Docker adapters: the docker CLI line is
//! built exactly as for a local daemon, then executed on the remote host
//! over the SSH adapter. Docker events keep the remote host identity.

use std::sync::Arc;

use async_trait::async_trait;

use super::docker::{ephemeral_name, resolve_mode, DockerAdapter, Mode};
use super::ssh::SshAdapter;
use super::{Adapter, Capabilities};
use crate::command::{AdapterKind, Command, RemoteDockerOptions, Shell, Target};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};
use crate::exec::ExecutionResult;

/// Adapter driving a Docker daemon on a remote host.
pub struct RemoteDockerAdapter {
    ssh: Arc<SshAdapter>,
    bus: Arc<EventBus>,
}

impl RemoteDockerAdapter {
    /// Shares the engine's SSH adapter (and so its connection pool).
    pub fn new(ssh: Arc<SshAdapter>, bus: Arc<EventBus>) -> Self {
        Self { ssh, bus }
    }

    fn options_of(cmd: &Command) -> Result<RemoteDockerOptions> {
        match &cmd.target {
            Target::RemoteDocker(opts) => Ok(opts.clone()),
            other => Err(Error::Validation(format!(
                "remote-docker adapter cannot execute a {:?} target",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl Adapter for RemoteDockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::RemoteDocker
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            tty: true,
            transfer: false,
            tunnel: true,
            port_forward: false,
            health: false,
        }
    }

    async fn execute(&self, cmd: Command) -> Result<ExecutionResult> {
        cmd.validate()?;
        let opts = Self::options_of(&cmd)?;
        let host = opts.ssh.host.clone();

        let (docker_args, container) = match resolve_mode(&opts.docker)? {
            Mode::Exec(container) => {
                self.bus.emit(
                    AdapterKind::RemoteDocker,
                    EventPayload::DockerExec {
                        container: container.clone(),
                        command: cmd.display_string(),
                    },
                );
                (
                    DockerAdapter::exec_args(&cmd, &opts.docker, &container)?,
                    container,
                )
            }
            Mode::Run(image) => {
                let name = opts
                    .docker
                    .config
                    .name
                    .clone()
                    .unwrap_or_else(ephemeral_name);
                self.bus.emit(
                    AdapterKind::RemoteDocker,
                    EventPayload::DockerRun {
                        image: image.clone(),
                        container: Some(name.clone()),
                        command: Some(cmd.display_string()),
                    },
                );
                (DockerAdapter::run_args(&cmd, &opts.docker, &image, &name)?, name)
            }
        };

        // The docker invocation becomes the remote command; env and cwd
        // were already folded into the docker args, so the SSH line is the
        // bare CLI call.
        let remote_cmd = Command {
            program: Some("docker".to_string()),
            args: docker_args,
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
            target: Target::Ssh(opts.ssh.clone()),
            progress: cmd.progress.clone(),
            kill: cmd.kill.clone(),
        };

        let annotate = |result: &mut ExecutionResult| {
            result.adapter = AdapterKind::RemoteDocker;
            result.command = cmd.display_string();
            result.host = Some(host.clone());
            result.container = Some(container.clone());
        };

        match self.ssh.execute(remote_cmd).await {
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
            Err(other) => Err(other),
        }
    }

    async fn is_available(&self) -> bool {
        self.ssh.is_available().await
    }

    async fn dispose(&self) -> Result<()> {
        // The SSH adapter (and its pool) is owned by the engine; nothing
        // extra to release here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DockerOptions, SshOptions};

    #[test]
    fn test_wrong_target_rejected() {
        let cmd = Command::new("ls").target(Target::Local);
        assert!(RemoteDockerAdapter::options_of(&cmd).is_err());
    }

    #[test]
    fn test_options_extracted() {
        let cmd = Command::new("ls").target(Target::RemoteDocker(RemoteDockerOptions {
            ssh: SshOptions::new("build-host", "ops"),
            docker: DockerOptions::container("builder"),
        }));
        let opts = RemoteDockerAdapter::options_of(&cmd).unwrap();
        assert_eq!(opts.ssh.host, "build-host");
        assert_eq!(opts.docker.container.as_deref(), Some("builder"));
    }
}
