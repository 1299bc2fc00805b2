use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::Result;

/// A JSON array persisted as a single file inside the extension's data dir.
///
/// Callers take a [`Snapshot`] while holding their own map lock, release the
/// lock, then [`JsonFile::write`] it. Writes run on the blocking pool, one at
/// a time, and a snapshot older than the last one written is dropped.
#[derive(Debug)]
pub struct JsonFile {
    path: PathBuf,
    next_seq: AtomicU64,
    written_seq: Mutex<u64>,
}

/// Serialized file contents, ordered by when they were taken.
#[derive(Debug)]
pub struct Snapshot {
    seq: u64,
    content: String,
}

impl JsonFile {
    pub fn new(data_dir: &Path, name: &str) -> Self {
        Self {
            path: data_dir.join(name),
            next_seq: AtomicU64::new(0),
            written_seq: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records. A missing file is an empty collection.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Serialize `items`. Call while holding the lock that guards them so
    /// sequence order matches mutation order.
    pub fn snapshot<T: Serialize>(&self, items: &[&T]) -> Result<Snapshot> {
        let content = serde_json::to_string_pretty(items)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Snapshot { seq, content })
    }

    /// Replace the file's contents with `snapshot` unless a newer one has
    /// already landed.
    pub async fn write(&self, snapshot: Snapshot) -> Result<()> {
        let mut written = self.written_seq.lock().await;
        if snapshot.seq <= *written {
            return Ok(());
        }
        let path = self.path.clone();
        let Snapshot { seq, content } = snapshot;
        tokio::task::spawn_blocking(move || write_atomic(&path, &content))
            .await
            .map_err(std::io::Error::other)??;
        *written = seq;
        Ok(())
    }
}

/// Writes to a sibling temp file first so a crash mid-write never leaves a
/// truncated array behind.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
