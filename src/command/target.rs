//! Adapter addressing
//!
//! A [`Target`] tells the engine where a command runs. Local needs no
//! addressing; the transport targets carry the options their adapter
//! needs to reach the host, container or pod.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tag identifying which adapter produced a result or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    Local,
    Ssh,
    Docker,
    Kubernetes,
    RemoteDocker,
    Mock,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Local => write!(f, "local"),
            AdapterKind::Ssh => write!(f, "ssh"),
            AdapterKind::Docker => write!(f, "docker"),
            AdapterKind::Kubernetes => write!(f, "kubernetes"),
            AdapterKind::RemoteDocker => write!(f, "remote-docker"),
            AdapterKind::Mock => write!(f, "mock"),
        }
    }
}

/// Where a command should execute.
#[derive(Debug, Clone, Default)]
pub enum Target {
    /// Spawn on the local host.
    Local,
    /// Execute on a remote host over SSH.
    Ssh(SshOptions),
    /// Execute in a Docker container (existing or ephemeral).
    Docker(DockerOptions),
    /// Execute in a Kubernetes pod.
    Kubernetes(KubernetesOptions),
    /// Drive a Docker daemon on a remote host reached over SSH.
    RemoteDocker(RemoteDockerOptions),
    /// Defer to the engine's probe order (mock if installed, else local).
    #[default]
    Auto,
    /// Scripted adapter for tests.
    Mock,
}

impl Target {
    /// The adapter kind this target resolves to, if unambiguous.
    pub fn kind(&self) -> Option<AdapterKind> {
        match self {
            Target::Local => Some(AdapterKind::Local),
            Target::Ssh(_) => Some(AdapterKind::Ssh),
            Target::Docker(_) => Some(AdapterKind::Docker),
            Target::Kubernetes(_) => Some(AdapterKind::Kubernetes),
            Target::RemoteDocker(_) => Some(AdapterKind::RemoteDocker),
            Target::Mock => Some(AdapterKind::Mock),
            Target::Auto => None,
        }
    }

    /// Host/container/pod identity used in cache fingerprints.
    pub fn identity(&self) -> String {
        match self {
            Target::Local => "local".to_string(),
            Target::Ssh(opts) => format!("ssh://{}@{}:{}", opts.username, opts.host, opts.port),
            Target::Docker(opts) => match (&opts.container, &opts.image) {
                (Some(container), _) => format!("docker://{}", container),
                (None, Some(image)) => format!("docker-run://{}", image),
                (None, None) => "docker://".to_string(),
            },
            Target::Kubernetes(opts) => format!(
                "k8s://{}/{}{}",
                opts.namespace,
                opts.pod,
                opts.container
                    .as_deref()
                    .map(|c| format!("/{}", c))
                    .unwrap_or_default()
            ),
            Target::RemoteDocker(opts) => format!(
                "remote-docker://{}@{}:{}",
                opts.ssh.username, opts.ssh.host, opts.ssh.port
            ),
            Target::Auto => "auto".to_string(),
            Target::Mock => "mock".to_string(),
        }
    }
}

// ============================================================================
// SSH
// ============================================================================

/// Identity material for one SSH authentication attempt.
///
/// Methods are tried in the order they were supplied.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Private key, on disk or inline, with optional passphrase.
    PrivateKey {
        key: KeyMaterial,
        passphrase: Option<String>,
    },
    /// SSH agent; `socket` overrides `SSH_AUTH_SOCK`.
    Agent { socket: Option<String> },
    /// Plain password.
    Password(String),
    /// Keyboard-interactive with a single response.
    KeyboardInteractive(String),
}

/// A private key, referenced by path or carried inline.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Path(PathBuf),
    Inline(String),
}

/// How a sudo password is delivered to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordMethod {
    /// Pipe the password into `sudo -S`.
    #[default]
    Stdin,
    /// Point `SUDO_ASKPASS` at a helper.
    Askpass,
    /// `echo <password> | sudo -S` inline. Visible in the remote process
    /// list; last resort.
    Echo,
    /// `sudo -S` fed through a closed stdin write, password never placed
    /// on the command line.
    Secure,
}

/// Sudo policy for SSH commands.
#[derive(Debug, Clone, Default)]
pub struct SudoConfig {
    pub enabled: bool,
    pub password: Option<String>,
    /// Target user, `root` when unset.
    pub user: Option<String>,
    pub password_method: PasswordMethod,
}

/// Addressing and identity for an SSH target.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Auth methods, tried in order.
    pub auth: Vec<AuthMethod>,
    pub sudo: Option<SudoConfig>,
    /// Timeout for establishing the TCP + SSH handshake.
    pub connect_timeout: Duration,
}

impl SshOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth: Vec::new(),
            sudo: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn auth(mut self, method: AuthMethod) -> Self {
        self.auth.push(method);
        self
    }

    pub fn sudo(mut self, sudo: SudoConfig) -> Self {
        self.sudo = Some(sudo);
        self
    }

    /// Digest of the identity material, so that credential changes produce
    /// a distinct pool key.
    pub fn auth_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for method in &self.auth {
            match method {
                AuthMethod::PrivateKey { key, passphrase } => {
                    hasher.update(b"key:");
                    match key {
                        KeyMaterial::Path(path) => hasher.update(path.to_string_lossy().as_bytes()),
                        KeyMaterial::Inline(pem) => hasher.update(pem.as_bytes()),
                    }
                    if let Some(phrase) = passphrase {
                        hasher.update(phrase.as_bytes());
                    }
                }
                AuthMethod::Agent { socket } => {
                    hasher.update(b"agent:");
                    if let Some(socket) = socket {
                        hasher.update(socket.as_bytes());
                    }
                }
                AuthMethod::Password(password) => {
                    hasher.update(b"password:");
                    hasher.update(password.as_bytes());
                }
                AuthMethod::KeyboardInteractive(response) => {
                    hasher.update(b"kbd:");
                    hasher.update(response.as_bytes());
                }
            }
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

// ============================================================================
// Docker
// ============================================================================

/// Restart policy for created containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_flag(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

/// A volume mount, `host:container[:ro]`.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeSpec {
    pub fn as_flag(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Healthcheck settings for created containers.
#[derive(Debug, Clone)]
pub struct Healthcheck {
    /// Command run inside the container.
    pub test: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Full create-config for `docker run`.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub entrypoint: Option<String>,
    pub env: Vec<(String, String)>,
    pub env_file: Option<PathBuf>,
    pub volumes: Vec<VolumeSpec>,
    /// `host:container` port publications.
    pub ports: Vec<String>,
    pub network: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// e.g. `512m`, `2g`.
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub restart: RestartPolicy,
    pub labels: Vec<(String, String)>,
    pub healthcheck: Option<Healthcheck>,
    pub privileged: bool,
}

/// Addressing for a Docker target.
///
/// `container` selects exec mode against an existing container; `image`
/// selects run mode with an ephemeral container. When both are set,
/// `container` wins.
#[derive(Debug, Clone, Default)]
pub struct DockerOptions {
    pub container: Option<String>,
    pub image: Option<String>,
    pub config: ContainerConfig,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub tty: bool,
    /// Remove the ephemeral container when the command settles.
    pub auto_remove: bool,
    /// Adapter-level env defaults, overridden by command env.
    pub default_env: Vec<(String, String)>,
}

impl DockerOptions {
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            auto_remove: true,
            ..Default::default()
        }
    }
}

/// Addressing for a Kubernetes target.
#[derive(Debug, Clone)]
pub struct KubernetesOptions {
    /// Pod name, or a label selector when prefixed with `-l `.
    pub pod: String,
    pub namespace: String,
    pub container: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Extra flags appended to `kubectl exec`.
    pub exec_flags: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
}

impl KubernetesOptions {
    pub fn pod(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            namespace: "default".to_string(),
            container: None,
            kubeconfig: None,
            context: None,
            exec_flags: Vec::new(),
            tty: false,
            stdin: false,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// SSH + Docker composition for a remote daemon.
#[derive(Debug, Clone)]
pub struct RemoteDockerOptions {
    pub ssh: SshOptions,
    pub docker: DockerOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_display() {
        assert_eq!(AdapterKind::Local.to_string(), "local");
        assert_eq!(AdapterKind::RemoteDocker.to_string(), "remote-docker");
    }

    #[test]
    fn test_target_identity() {
        let target = Target::Ssh(SshOptions::new("db1", "deploy").port(2222));
        assert_eq!(target.identity(), "ssh://deploy@db1:2222");

        let target = Target::Docker(DockerOptions::container("web"));
        assert_eq!(target.identity(), "docker://web");

        let target = Target::Kubernetes(
            KubernetesOptions::pod("api-0").namespace("prod").container("app"),
        );
        assert_eq!(target.identity(), "k8s://prod/api-0/app");
    }

    #[test]
    fn test_auth_fingerprint_changes_with_credentials() {
        let a = SshOptions::new("h", "u").auth(AuthMethod::Password("one".into()));
        let b = SshOptions::new("h", "u").auth(AuthMethod::Password("two".into()));
        assert_ne!(a.auth_fingerprint(), b.auth_fingerprint());

        let c = SshOptions::new("h", "u").auth(AuthMethod::Password("one".into()));
        assert_eq!(a.auth_fingerprint(), c.auth_fingerprint());
    }

    #[test]
    fn test_volume_spec_flag() {
        let rw = VolumeSpec {
            source: "/data".into(),
            target: "/mnt".into(),
            read_only: false,
        };
        assert_eq!(rw.as_flag(), "/data:/mnt");

        let ro = VolumeSpec {
            source: "/data".into(),
            target: "/mnt".into(),
            read_only: true,
        };
        assert_eq!(ro.as_flag(), "/data:/mnt:ro");
    }

    #[test]
    fn test_docker_mode_selection() {
        let opts = DockerOptions::image("alpine");
        assert!(opts.auto_remove);
        assert!(opts.container.is_none());
    }
}
