//! File and folder transfers.
//!
//! Outbound: a file becomes `FileStart` (JSON [`FileMeta`]), a run of
//! `FileChunk` envelopes of at most one buffer each, and `FileEnd`. Folders
//! repeat this per contained file. Inbound bytes are written to disk as they
//! arrive by a [`TransferSession`].

use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::PartialFilePolicy;
use crate::events::EventHandler;
use crate::tcp::Connection;
use crate::types::{ConnectionId, Envelope, EnvelopeKind, FileMeta, Result, TetherError};

/// Totals for a finished folder transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderSummary {
    pub files: u64,
    pub bytes: u64,
}

/// Send one file. `target` is the path the peer stores it under, relative to
/// its receive directory.
///
/// Holds the connection's transfer gate for the whole file; ordinary messages
/// can still go out between chunks.
pub async fn send_file(
    conn: &Connection,
    source: &Path,
    target: &str,
    encrypt: bool,
) -> Result<u64> {
    let _transfer = conn.transfer_gate().lock().await;
    stream_file(conn, source, target, encrypt).await
}

/// Send every file below `source`, recreating the tree under `target` on the
/// peer.
pub async fn send_folder(
    conn: &Connection,
    source: &Path,
    target: &str,
    encrypt: bool,
) -> Result<FolderSummary> {
    let root = source.to_path_buf();
    let files = tokio::task::spawn_blocking(move || list_files(&root))
        .await
        .map_err(|e| TetherError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    let _transfer = conn.transfer_gate().lock().await;
    let mut summary = FolderSummary::default();
    for (path, relative) in files {
        let wire_target = join_wire_path(target, &relative);
        summary.bytes += stream_file(conn, &path, &wire_target, encrypt).await?;
        summary.files += 1;
    }
    info!(
        "Connection {} sent folder {} ({} files, {} bytes)",
        conn.id(),
        source.display(),
        summary.files,
        summary.bytes
    );
    Ok(summary)
}

async fn stream_file(conn: &Connection, source: &Path, target: &str, encrypt: bool) -> Result<u64> {
    let transfer_err = |source_err: std::io::Error| TetherError::Transfer {
        path: source.to_path_buf(),
        source: source_err,
    };

    let mut file = File::open(source).await.map_err(transfer_err)?;
    let size = file.metadata().await.map_err(transfer_err)?.len();

    let meta = FileMeta {
        path: target.to_string(),
        size,
    };
    conn.send_envelope(
        Envelope::new(EnvelopeKind::FileStart, serde_json::to_vec(&meta)?).with_encryption(encrypt),
    )
    .await?;

    let mut buf = vec![0u8; conn.chunk_size()];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(transfer_err)?;
        if n == 0 {
            break;
        }
        conn.send_envelope(
            Envelope::new(EnvelopeKind::FileChunk, Bytes::copy_from_slice(&buf[..n]))
                .with_encryption(encrypt),
        )
        .await?;
        sent += n as u64;
    }

    conn.send_envelope(Envelope::new(EnvelopeKind::FileEnd, Bytes::new()))
        .await?;
    debug!(
        "Connection {} sent {} as {:?} ({} bytes)",
        conn.id(),
        source.display(),
        target,
        sent
    );
    Ok(sent)
}

/// Regular files below `root` with their paths relative to `root`, sorted
fn list_files(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    if !root.is_dir() {
        return Err(TetherError::Transfer {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| TetherError::Transfer {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push((entry.path().to_path_buf(), relative.to_path_buf()));
        }
    }
    Ok(files)
}

/// Join a relative filesystem path onto a wire target with `/` separators
fn join_wire_path(target: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = target
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    for comp in relative.components() {
        if let Component::Normal(s) = comp {
            parts.push(s.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

/// Resolve a peer-supplied path under `root`.
///
/// Rejects NUL bytes, absolute paths and parent components; on Windows also
/// `:` inside a component.
pub fn resolve_under_root(root: &Path, wire_path: &str) -> Result<PathBuf> {
    if wire_path.contains('\0') {
        return Err(TetherError::UnsafePath("path contains NUL byte".into()));
    }

    let mut safe = PathBuf::new();
    for part in wire_path.split('/') {
        for comp in Path::new(part).components() {
            match comp {
                Component::CurDir => {}
                Component::Normal(s) => {
                    #[cfg(windows)]
                    if s.to_string_lossy().contains(':') {
                        return Err(TetherError::UnsafePath(format!(
                            "component contains colon: {}",
                            wire_path
                        )));
                    }
                    safe.push(s);
                }
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(TetherError::UnsafePath(format!(
                        "disallowed component in {}",
                        wire_path
                    )));
                }
            }
        }
    }
    if safe.as_os_str().is_empty() || wire_path.starts_with('/') {
        return Err(TetherError::UnsafePath(format!("unusable path {:?}", wire_path)));
    }
    Ok(root.join(safe))
}

/// An inbound file being written to disk
pub struct TransferSession {
    id: ConnectionId,
    target: PathBuf,
    total: u64,
    written: u64,
    encrypted: bool,
    file: BufWriter<File>,
    events: Arc<dyn EventHandler>,
}

impl TransferSession {
    /// Create the destination file (and its parent directories)
    pub async fn open(
        id: ConnectionId,
        root: &Path,
        meta: &FileMeta,
        encrypted: bool,
        events: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let target = resolve_under_root(root, &meta.path)?;
        let transfer_err = |source: std::io::Error| TetherError::Transfer {
            path: target.clone(),
            source,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transfer_err)?;
        }
        let file = File::create(&target).await.map_err(transfer_err)?;
        debug!(
            "Connection {} receiving {} ({} bytes, encrypted={})",
            id,
            target.display(),
            meta.size,
            encrypted
        );

        Ok(Self {
            id,
            target,
            total: meta.size,
            written: 0,
            encrypted,
            file: BufWriter::new(file),
            events,
        })
    }

    /// Append decoded bytes and report progress
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|source| TetherError::Transfer {
                path: self.target.clone(),
                source,
            })?;
        self.written += bytes.len() as u64;
        self.events
            .on_transfer_progress(self.id, self.written, self.total);
        Ok(())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Flush and close; the written size must match the declared total
    pub async fn finish(mut self) -> Result<PathBuf> {
        let transfer_err = |source: std::io::Error| TetherError::Transfer {
            path: self.target.clone(),
            source,
        };
        self.file.flush().await.map_err(transfer_err)?;
        self.file.get_mut().sync_all().await.map_err(transfer_err)?;

        if self.written != self.total {
            return Err(transfer_err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "received {} bytes, {} were declared",
                    self.written, self.total
                ),
            )));
        }
        Ok(self.target)
    }

    /// Give up on the file, keeping or deleting what was written
    pub async fn abandon(mut self, policy: PartialFilePolicy) {
        let _ = self.file.flush().await;
        drop(self.file);
        warn!(
            "Connection {} abandoned {} after {}/{} bytes",
            self.id,
            self.target.display(),
            self.written,
            self.total
        );
        if policy == PartialFilePolicy::Delete {
            remove_partial(&self.target).await;
        }
    }
}

/// Delete a truncated file, logging rather than failing
pub(crate) async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove partial file {}: {}", path.display(), e);
    }
}
