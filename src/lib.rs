//! uxec — universal command-execution engine
//!
//! One API for running shell-style commands across four kinds of targets:
//! the local host, remote hosts over SSH, Docker containers and Kubernetes
//! pods. Cross-cutting machinery (retry, caching, events, cancellation,
//! piping, tunnels, file transfer) composes over pluggable adapters.
//!
//! ```no_run
//! use uxec::{Command, ExecutionEngine};
//!
//! # async fn demo() -> uxec::Result<()> {
//! let engine = ExecutionEngine::new();
//!
//! let result = engine.run(Command::shell("uname -a")).await?;
//! println!("{}", result.stdout_text());
//!
//! engine.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod command;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec;

// Re-export commonly used types
pub use command::{
    AdapterKind, AuthMethod, Command, CommandTemplate, ContainerConfig, DockerOptions,
    KubernetesOptions, RemoteDockerOptions, Shell, SshOptions, SudoConfig, Target,
};
pub use engine::{
    default_engine, dispose_default, init_default, ContextConfig, EngineConfig, ExecutionEngine,
};
pub use error::{Error, ErrorKind, Result, TransferDirection};
pub use events::{Event, EventBus, EventFilter, EventPayload};
pub use exec::{
    Backoff, CacheConfig, CachePolicy, ExecutionResult, ProcessPromise, RetryPolicy, StdinHandle,
};
