//! SFTP file transfer over a pooled connection
//!
//! Large files are streamed chunk by chunk, never buffered whole.
//! Directory uploads walk the local tree, recreate the remote layout and
//! copy files under a concurrency cap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::{stream, StreamExt};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use super::connection::SshConnection;
use crate::command::AdapterKind;
use crate::error::{Error, Result, TransferDirection};
use crate::events::{EventBus, EventPayload};

/// Predicate deciding which files a directory transfer includes.
pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// SFTP client bound to one SSH connection.
pub struct SftpClient {
    session: SftpSession,
    bus: Arc<EventBus>,
}

impl SftpClient {
    /// Open the SFTP subsystem on a fresh channel.
    pub(crate) async fn open(connection: &SshConnection, bus: Arc<EventBus>) -> Result<Self> {
        let channel = connection.open_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(Error::Sftp)?;
        Ok(Self { session, bus })
    }

    fn emit_start(&self, direction: TransferDirection, source: &str, destination: &str) {
        self.bus.emit(
            AdapterKind::Ssh,
            EventPayload::TransferStart {
                direction,
                source: source.to_string(),
                destination: destination.to_string(),
            },
        );
    }

    fn emit_complete(
        &self,
        direction: TransferDirection,
        source: &str,
        destination: &str,
        bytes: u64,
        started: Instant,
    ) {
        self.bus.emit(
            AdapterKind::Ssh,
            EventPayload::TransferComplete {
                direction,
                source: source.to_string(),
                destination: destination.to_string(),
                bytes_transferred: bytes,
                duration: started.elapsed(),
            },
        );
    }

    fn emit_error(
        &self,
        direction: TransferDirection,
        source: &str,
        destination: &str,
        error: &Error,
    ) {
        self.bus.emit(
            AdapterKind::Ssh,
            EventPayload::TransferError {
                direction,
                source: source.to_string(),
                destination: destination.to_string(),
                error: error.to_string(),
            },
        );
    }

    /// Upload one file; returns the byte count. A zero-byte file produces
    /// a zero-byte remote copy.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64> {
        let source = local.display().to_string();
        self.emit_start(TransferDirection::Upload, &source, remote);
        let started = Instant::now();

        let outcome = self.copy_local_to_remote(local, remote).await;
        match outcome {
            Ok(bytes) => {
                self.emit_complete(TransferDirection::Upload, &source, remote, bytes, started);
                Ok(bytes)
            }
            Err(error) => {
                self.emit_error(TransferDirection::Upload, &source, remote, &error);
                Err(error)
            }
        }
    }

    async fn copy_local_to_remote(&self, local: &Path, remote: &str) -> Result<u64> {
        let mut file = tokio::fs::File::open(local).await.map_err(|e| Error::Transfer {
            direction: TransferDirection::Upload,
            source_path: local.display().to_string(),
            destination: remote.to_string(),
            message: e.to_string(),
        })?;

        let mut remote_file = self.session.create(remote).await.map_err(Error::Sftp)?;
        let bytes = tokio::io::copy(&mut file, &mut remote_file)
            .await
            .map_err(|e| Error::Transfer {
                direction: TransferDirection::Upload,
                source_path: local.display().to_string(),
                destination: remote.to_string(),
                message: e.to_string(),
            })?;
        remote_file.shutdown().await.map_err(Error::Io)?;
        Ok(bytes)
    }

    /// Upload from an arbitrary reader.
    pub async fn upload_stream<R>(&self, mut reader: R, remote: &str) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.emit_start(TransferDirection::Upload, "<stream>", remote);
        let started = Instant::now();

        let run = async {
            let mut remote_file = self.session.create(remote).await.map_err(Error::Sftp)?;
            let bytes = tokio::io::copy(&mut reader, &mut remote_file)
                .await
                .map_err(Error::Io)?;
            remote_file.shutdown().await.map_err(Error::Io)?;
            Ok(bytes)
        };

        match run.await {
            Ok(bytes) => {
                self.emit_complete(TransferDirection::Upload, "<stream>", remote, bytes, started);
                Ok(bytes)
            }
            Err(error) => {
                self.emit_error(TransferDirection::Upload, "<stream>", remote, &error);
                Err(error)
            }
        }
    }

    /// Download one file; returns the byte count.
    pub async fn download_file(&self, remote: &str, local: &Path) -> Result<u64> {
        let destination = local.display().to_string();
        self.emit_start(TransferDirection::Download, remote, &destination);
        let started = Instant::now();

        let run = async {
            let mut remote_file = self.session.open(remote).await.map_err(Error::Sftp)?;
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
            }
            let mut file = tokio::fs::File::create(local).await.map_err(Error::Io)?;
            let bytes = tokio::io::copy(&mut remote_file, &mut file)
                .await
                .map_err(Error::Io)?;
            file.flush().await.map_err(Error::Io)?;
            Ok(bytes)
        };

        match run.await {
            Ok(bytes) => {
                self.emit_complete(
                    TransferDirection::Download,
                    remote,
                    &destination,
                    bytes,
                    started,
                );
                Ok(bytes)
            }
            Err(error) => {
                self.emit_error(TransferDirection::Download, remote, &destination, &error);
                Err(error)
            }
        }
    }

    /// Recursively upload a directory.
    ///
    /// `filter` decides file inclusion by local path; `concurrency` caps
    /// parallel file copies. Returns total bytes.
    pub async fn upload_directory(
        &self,
        local: &Path,
        remote: &str,
        filter: Option<PathFilter>,
        concurrency: usize,
    ) -> Result<u64> {
        let source = local.display().to_string();
        self.emit_start(TransferDirection::Upload, &source, remote);
        let started = Instant::now();

        let root = local.to_path_buf();
        let walked = tokio::task::spawn_blocking(move || {
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(&root).min_depth(1) {
                match entry {
                    Ok(entry) => {
                        let rel = entry
                            .path()
                            .strip_prefix(&root)
                            .unwrap_or(entry.path())
                            .to_path_buf();
                        if entry.file_type().is_dir() {
                            dirs.push(rel);
                        } else if entry.file_type().is_file() {
                            files.push((entry.path().to_path_buf(), rel));
                        }
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
            dirs.sort();
            Ok((dirs, files))
        })
        .await
        .map_err(|e| Error::Transfer {
            direction: TransferDirection::Upload,
            source_path: source.clone(),
            destination: remote.to_string(),
            message: e.to_string(),
        })?;

        let (dirs, files) = walked.map_err(|message| Error::Transfer {
            direction: TransferDirection::Upload,
            source_path: source.clone(),
            destination: remote.to_string(),
            message,
        })?;

        let run = async {
            self.ensure_remote_dir(remote).await;
            for dir in &dirs {
                let remote_dir = join_remote(remote, dir);
                self.ensure_remote_dir(&remote_dir).await;
            }

            let files: Vec<(PathBuf, PathBuf)> = files
                .into_iter()
                .filter(|(path, _)| filter.as_ref().map_or(true, |f| f(path)))
                .collect();

            let mut total = 0u64;
            let mut copies = stream::iter(files.into_iter().map(|(path, rel)| {
                let remote_path = join_remote(remote, &rel);
                async move {
                    debug!(local = %path.display(), remote = %remote_path, "uploading");
                    self.copy_local_to_remote(&path, &remote_path).await
                }
            }))
            .buffer_unordered(concurrency.max(1));

            while let Some(copied) = copies.next().await {
                total += copied?;
            }
            Ok(total)
        };

        match run.await {
            Ok(bytes) => {
                self.emit_complete(TransferDirection::Upload, &source, remote, bytes, started);
                Ok(bytes)
            }
            Err(error) => {
                self.emit_error(TransferDirection::Upload, &source, remote, &error);
                Err(error)
            }
        }
    }

    /// Recursively download a directory.
    pub async fn download_directory(&self, remote: &str, local: &Path) -> Result<u64> {
        let destination = local.display().to_string();
        self.emit_start(TransferDirection::Download, remote, &destination);
        let started = Instant::now();

        match self.download_tree(remote, local).await {
            Ok(bytes) => {
                self.emit_complete(
                    TransferDirection::Download,
                    remote,
                    &destination,
                    bytes,
                    started,
                );
                Ok(bytes)
            }
            Err(error) => {
                self.emit_error(TransferDirection::Download, remote, &destination, &error);
                Err(error)
            }
        }
    }

    fn download_tree<'a>(
        &'a self,
        remote: &'a str,
        local: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(local).await.map_err(Error::Io)?;

            let mut total = 0u64;
            let entries = self.session.read_dir(remote).await.map_err(Error::Sftp)?;
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let remote_child = format!("{}/{}", remote.trim_end_matches('/'), name);
                let local_child = local.join(&name);

                if entry.file_type().is_dir() {
                    total += self.download_tree(&remote_child, &local_child).await?;
                } else {
                    let mut remote_file =
                        self.session.open(&remote_child).await.map_err(Error::Sftp)?;
                    let mut file =
                        tokio::fs::File::create(&local_child).await.map_err(Error::Io)?;
                    total += tokio::io::copy(&mut remote_file, &mut file)
                        .await
                        .map_err(Error::Io)?;
                }
            }
            Ok(total)
        })
    }

    /// Create a remote directory, tolerating pre-existing ones.
    async fn ensure_remote_dir(&self, remote: &str) {
        if let Err(e) = self.session.create_dir(remote).await {
            if self.session.metadata(remote).await.is_err() {
                warn!(remote, error = %e, "failed to create remote directory");
            }
        }
    }
}

/// Join a relative path onto a remote base with `/` separators.
fn join_remote(base: &str, rel: &Path) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for component in rel.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(
            join_remote("/srv/app/", Path::new("conf/app.toml")),
            "/srv/app/conf/app.toml"
        );
        assert_eq!(join_remote("/srv", Path::new("x")), "/srv/x");
    }
}
