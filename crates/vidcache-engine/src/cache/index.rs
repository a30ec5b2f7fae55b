//! # Cache Index
//!
//! Durable record of which videos are cached, where, how large and when they
//! were last used. The in-memory table is authoritative while the process
//! runs; every mutation is mirrored to the manifest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::lease::{LeaseTable, ReadLease};
use super::locks::{KeyGuard, KeyedLocks};
use super::manifest::{self, ReconcileReport};
use super::types::{CacheUsage, VideoEntry, VideoStatus};
use super::MANIFEST_FILE;
use crate::error::{EngineError, Result};
use crate::source::VideoId;

#[derive(Debug)]
pub struct CacheIndex {
    storage_dir: PathBuf,
    manifest_path: PathBuf,
    entries: RwLock<HashMap<VideoId, VideoEntry>>,
    locks: KeyedLocks,
    leases: LeaseTable,
    // serialises snapshot + write so the manifest never regresses
    persist_lock: AsyncMutex<()>,
    // access times changed since the last write
    dirty: AtomicBool,
}

impl CacheIndex {
    /// Open the index in `storage_dir`, reconciling the manifest with the directory.
    pub async fn open(storage_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir).await?;

        let manifest_path = storage_dir.join(MANIFEST_FILE);
        let loaded = manifest::load(&manifest_path).await;
        let (entries, report) = manifest::reconcile(&storage_dir, loaded).await?;
        log_reconcile(&storage_dir, &report);

        let index = Arc::new(Self {
            storage_dir,
            manifest_path,
            entries: RwLock::new(entries),
            locks: KeyedLocks::new(),
            leases: LeaseTable::new(),
            persist_lock: AsyncMutex::new(()),
            dirty: AtomicBool::new(false),
        });
        index.persist().await?;
        Ok(index)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn lookup(&self, id: &VideoId) -> Option<VideoEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Atomic create-or-replace keyed by the entry's id.
    pub async fn upsert(&self, entry: VideoEntry) -> Result<()> {
        debug!(id = %entry.id, status = entry.status.as_str(), "Upserting cache entry");
        self.entries.write().insert(entry.id.clone(), entry);
        self.persist().await
    }

    /// Record a cache hit. Returns the refreshed entry.
    ///
    /// Only the in-memory table changes; the new access time reaches the
    /// manifest with the next mutation or [`CacheIndex::flush`].
    pub fn touch(&self, id: &VideoId) -> Result<VideoEntry> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        entry.last_accessed_at = Utc::now();
        self.dirty.store(true, Ordering::Release);
        Ok(entry.clone())
    }

    /// Write pending access times to the manifest, if any.
    pub async fn flush(&self) -> Result<bool> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    /// Check a `Ready` entry against its file, dropping the row when the file
    /// is gone or no longer matches.
    ///
    /// Returns the entry when it can still be served. Other states pass
    /// through unchanged.
    pub async fn verify_ready(&self, guard: &KeyGuard) -> Result<Option<VideoEntry>> {
        let id = guard.id();
        let Some(entry) = self.lookup(id) else {
            return Ok(None);
        };
        let Some(path) = entry.file_path.as_deref().filter(|_| entry.is_ready()) else {
            return Ok(Some(entry));
        };

        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() == entry.size_bytes => Ok(Some(entry)),
            Ok(meta) => {
                warn!(
                    id = %id,
                    expected = entry.size_bytes,
                    actual = meta.len(),
                    "Cached file changed on disk, dropping entry"
                );
                self.remove_locked(guard).await?;
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(id = %id, path = ?path, "Cached file disappeared, dropping entry");
                self.remove_locked(guard).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an entry together with its backing file.
    pub async fn remove(&self, id: &VideoId) -> Result<Option<VideoEntry>> {
        let guard = self.lock(id).await;
        self.remove_locked(&guard).await
    }

    /// [`CacheIndex::remove`] for callers already holding the id's lock.
    ///
    /// The entry disappears first so new lookups miss; if the file cannot be
    /// deleted the entry is restored. Open handles keep reading the unlinked
    /// file until they finish.
    pub async fn remove_locked(&self, guard: &KeyGuard) -> Result<Option<VideoEntry>> {
        let entry = self.entries.write().remove(guard.id());
        self.delete_removed(guard.id(), entry).await
    }

    /// Remove a `Ready` entry unless a read lease pins it.
    ///
    /// The lease check and the removal happen under the table lock, which
    /// [`CacheIndex::acquire_lease`] also takes, so no lease can be handed out
    /// for an entry that is about to disappear.
    pub async fn evict_locked(&self, guard: &KeyGuard) -> Result<Option<VideoEntry>> {
        let id = guard.id();
        let entry = {
            let mut entries = self.entries.write();
            match entries.get(id) {
                Some(e) if e.is_ready() && !self.leases.is_leased(id) => entries.remove(id),
                _ => None,
            }
        };
        self.delete_removed(id, entry).await
    }

    async fn delete_removed(
        &self,
        id: &VideoId,
        entry: Option<VideoEntry>,
    ) -> Result<Option<VideoEntry>> {
        let Some(entry) = entry else {
            return Ok(None);
        };

        if let Some(path) = &entry.file_path {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(id = %id, path = ?path, "Cached file already gone");
                }
                Err(e) => {
                    warn!(id = %id, path = ?path, error = %e, "Failed to delete cached file, keeping entry");
                    self.entries.write().insert(id.clone(), entry);
                    return Err(e.into());
                }
            }
        }

        self.persist().await?;
        debug!(id = %id, bytes = entry.size_bytes, "Removed cache entry");
        Ok(Some(entry))
    }

    /// All entries, least recently used first, ties by creation time.
    pub fn list_all(&self) -> Vec<VideoEntry> {
        let mut entries: Vec<VideoEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        entries
    }

    /// Bytes held by `Ready` entries.
    pub fn total_size_bytes(&self) -> u64 {
        self.usage().total_bytes
    }

    pub fn usage(&self) -> CacheUsage {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == VideoStatus::Ready)
            .fold(CacheUsage::default(), |mut usage, e| {
                usage.total_bytes = usage.total_bytes.saturating_add(e.size_bytes);
                usage.ready_entries += 1;
                usage
            })
    }

    /// Exclusive access to one id, shared with the orchestrator and eviction.
    pub async fn lock(&self, id: &VideoId) -> KeyGuard {
        self.locks.lock(id).await
    }

    /// Pin a `Ready` entry while its file is served.
    pub fn acquire_lease(&self, id: &VideoId) -> Option<(VideoEntry, ReadLease)> {
        let entries = self.entries.read();
        let entry = entries.get(id).filter(|e| e.is_ready())?;
        Some((entry.clone(), self.leases.acquire(id)))
    }

    pub fn lease_count(&self, id: &VideoId) -> usize {
        self.leases.count(id)
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        self.dirty.store(false, Ordering::Release);
        let snapshot = self.list_all();
        manifest::store(&self.manifest_path, snapshot).await?;
        Ok(())
    }
}

fn log_reconcile(storage_dir: &Path, report: &ReconcileReport) {
    info!(
        dir = ?storage_dir,
        kept = report.kept,
        adopted = report.adopted,
        interrupted = report.purged_interrupted,
        missing = report.purged_missing,
        mismatched = report.purged_mismatched,
        duplicates = report.duplicates_removed,
        "Cache index opened"
    );
}
