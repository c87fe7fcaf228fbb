//! Snapshot storage.
//!
//! A snapshot is written once and never replaced: `write` on an existing key
//! fails with [`Error::AlreadyExists`] and leaves the stored bytes alone.
//! Readers therefore never race a writer on the same key.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{Error, Result, SnapshotKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Create-only snapshot store keyed by [`SnapshotKey`].
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn exists(&self, key: &SnapshotKey) -> Result<bool>;

    /// Fails with [`Error::NotFound`] for unknown keys.
    async fn read(&self, key: &SnapshotKey) -> Result<Vec<u8>>;

    /// Fails with [`Error::AlreadyExists`] if `key` is taken.
    async fn write(&self, key: &SnapshotKey, payload: &[u8]) -> Result<()>;

    /// All stored keys, oldest first.
    async fn list(&self) -> Result<Vec<SnapshotKey>>;
}

// ── Filesystem ────────────────────────────────────────────────────────

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// One `<key>.json` file per snapshot in a flat directory.
///
/// Writes go to a hidden temp file that is fsynced and then hard-linked into
/// place. Linking fails if the target exists, which makes publication atomic
/// and create-only even with concurrent writers.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    dir: PathBuf,
}

impl FsSnapshotStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &SnapshotKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn temp_path(&self, key: &SnapshotKey) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{key}.{}.{seq}.tmp", std::process::id()))
    }
}

async fn write_synced(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(payload).await?;
    file.sync_all().await
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn exists(&self, key: &SnapshotKey) -> Result<bool> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, key: &SnapshotKey) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &SnapshotKey, payload: &[u8]) -> Result<()> {
        if self.exists(key).await? {
            return Err(Error::AlreadyExists(key.clone()));
        }

        let tmp = self.temp_path(key);
        let target = self.path_for(key);

        let linked = match write_synced(&tmp, payload).await {
            Ok(()) => tokio::fs::hard_link(&tmp, &target).await,
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", tmp.display(), e);
            }
        }

        match linked {
            Ok(()) => {
                debug!("Stored {} ({} bytes)", target.display(), payload.len());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyExists(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SnapshotKey>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(key) = SnapshotKey::parse(stem) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// ── In-memory ─────────────────────────────────────────────────────────

/// DashMap-backed store for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    entries: Arc<DashMap<SnapshotKey, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn exists(&self, key: &SnapshotKey) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn read(&self, key: &SnapshotKey) -> Result<Vec<u8>> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    async fn write(&self, key: &SnapshotKey, payload: &[u8]) -> Result<()> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists(key.clone())),
            Entry::Vacant(slot) => {
                slot.insert(payload.to_vec());
                Ok(())
            }
        }
    }

    async fn list(&self) -> Result<Vec<SnapshotKey>> {
        let mut keys: Vec<SnapshotKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}
