//! File helpers dispatched through the active adapter
//!
//! Local targets use the filesystem directly; remote targets go through
//! the same exec path as any other command (`cat`, `sh -c 'cat > …'`,
//! `rm -f`).

use std::path::{Path, PathBuf};

use crate::command::{AdapterKind, Command, Target};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};

/// Search `PATH` for an executable, like the shell's `which`.
pub fn which(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Current working directory of the process.
pub fn pwd() -> Result<PathBuf> {
    Ok(std::env::current_dir()?)
}

fn is_local(target: &Target) -> bool {
    matches!(target, Target::Local | Target::Auto)
}

/// Read a file on the target.
pub(crate) async fn read_file(
    core: &std::sync::Arc<super::EngineCore>,
    target: &Target,
    path: &str,
    bus: &EventBus,
) -> Result<Vec<u8>> {
    let data = if is_local(target) {
        tokio::fs::read(path).await.map_err(Error::Io)?
    } else {
        let cmd = Command::new("cat").arg(path).target(target.clone());
        let result = core.dispatch(cmd).await?;
        result.stdout
    };

    bus.emit(
        adapter_tag(target),
        EventPayload::FileRead {
            path: path.to_string(),
            size: Some(data.len() as u64),
        },
    );
    Ok(data)
}

/// Write a file on the target.
pub(crate) async fn write_file(
    core: &std::sync::Arc<super::EngineCore>,
    target: &Target,
    path: &str,
    contents: &[u8],
    bus: &EventBus,
) -> Result<()> {
    if is_local(target) {
        tokio::fs::write(path, contents).await.map_err(Error::Io)?;
    } else {
        let cmd = Command::shell(format!("cat > {}", shell_words::quote(path)))
            .stdin_bytes(contents.to_vec())
            .target(target.clone());
        core.dispatch(cmd).await?;
    }

    bus.emit(
        adapter_tag(target),
        EventPayload::FileWrite {
            path: path.to_string(),
            size: Some(contents.len() as u64),
        },
    );
    Ok(())
}

/// Delete a file on the target.
pub(crate) async fn delete_file(
    core: &std::sync::Arc<super::EngineCore>,
    target: &Target,
    path: &str,
    bus: &EventBus,
) -> Result<()> {
    if is_local(target) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
    } else {
        let cmd = Command::new("rm").args(["-f", path]).target(target.clone());
        core.dispatch(cmd).await?;
    }

    bus.emit(
        adapter_tag(target),
        EventPayload::FileDelete {
            path: path.to_string(),
        },
    );
    Ok(())
}

fn adapter_tag(target: &Target) -> AdapterKind {
    target.kind().unwrap_or(AdapterKind::Local)
}
