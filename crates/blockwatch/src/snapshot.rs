//! Window snapshots: restore at startup, latest-wins background writes.
//!
//! The snapshot is one JSON array of [BlockSummary], newest first. Writes never block the
//! watcher: it publishes the sorted window into a `watch` slot and a writer task saves
//! whatever is newest when it gets to it. A failed write is logged and forgotten.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::summary::BlockSummary;

/// Default snapshot location, relative to the working directory.
pub const DEFAULT_SNAPSHOT_PATH: &str = "blocks.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot not found")]
    NotFound,
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("snapshot writer task failed: {0}")]
    Task(String),
}

/// Durable home for the window.
pub trait SnapshotStore: Send + Sync + 'static {
    fn load(&self) -> Result<Vec<BlockSummary>, SnapshotError>;
    fn save(&self, blocks: &[BlockSummary]) -> Result<(), SnapshotError>;
}

/// Snapshot as a JSON file, replaced atomically through a sibling temp file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Vec<BlockSummary>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(SnapshotError::NotFound),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, blocks: &[BlockSummary]) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec(blocks)?;
        let tmp = self.temp_path();
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Load the last snapshot. Any failure means "start empty".
pub fn restore(store: &dyn SnapshotStore) -> Vec<BlockSummary> {
    match store.load() {
        Ok(blocks) => {
            tracing::info!(count = blocks.len(), "window restored from snapshot");
            blocks
        }
        Err(SnapshotError::NotFound) => {
            tracing::debug!("no snapshot, starting empty");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(reason = %e, "snapshot unusable, starting empty");
            Vec::new()
        }
    }
}

/// Latest-wins handle to the background writer.
pub struct SnapshotWriter {
    tx: watch::Sender<Option<Arc<[BlockSummary]>>>,
    task: JoinHandle<()>,
}

impl SnapshotWriter {
    /// Spawn the writer task on the current runtime.
    pub fn spawn(store: Arc<dyn SnapshotStore>) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(write_loop(store, rx));
        Self { tx, task }
    }

    /// Queue `blocks` for writing, superseding anything not yet written.
    pub fn submit(&self, blocks: Arc<[BlockSummary]>) {
        // The receiver lives as long as the task; a send error means it already exited.
        if self.tx.send(Some(blocks)).is_err() {
            tracing::warn!("snapshot writer gone, snapshot not queued");
        }
    }

    /// Write whatever is still queued, then stop the task.
    pub async fn close(self) -> Result<(), SnapshotError> {
        let Self { tx, task } = self;
        drop(tx);
        task.await.map_err(|e| SnapshotError::Task(e.to_string()))
    }
}

async fn write_loop(
    store: Arc<dyn SnapshotStore>,
    mut rx: watch::Receiver<Option<Arc<[BlockSummary]>>>,
) {
    // `changed` still reports a value sent just before the sender was dropped.
    while rx.changed().await.is_ok() {
        let Some(blocks) = rx.borrow_and_update().clone() else {
            continue;
        };
        write_once(&store, blocks).await;
    }
}

async fn write_once(store: &Arc<dyn SnapshotStore>, blocks: Arc<[BlockSummary]>) {
    let store = Arc::clone(store);
    let count = blocks.len();
    match tokio::task::spawn_blocking(move || store.save(&blocks)).await {
        Ok(Ok(())) => tracing::debug!(count, "snapshot written"),
        Ok(Err(e)) => tracing::warn!(reason = %e, "snapshot write failed"),
        Err(e) => tracing::warn!(reason = %e, "snapshot write task panicked"),
    }
}
