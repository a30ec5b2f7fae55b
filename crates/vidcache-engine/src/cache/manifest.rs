//! # Manifest
//!
//! Lightweight JSON record of the cache index, written next to the media
//! files. On startup the manifest is reconciled against the directory so the
//! index survives crashes: rows without files are purged, interrupted
//! downloads are discarded and stray media files are adopted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io;
use tracing::{debug, info, warn};

use super::types::{VideoEntry, VideoStatus};
use super::{MANIFEST_FILE, STAGING_DIR};
use crate::source::VideoId;

const MANIFEST_VERSION: u32 = 1;

/// Extensions recognised as cached media when scanning the directory
pub const MEDIA_EXTENSIONS: &[&str] = &["webm", "mp4", "mkv", "m4v", "mov"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<VideoEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<VideoEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries,
        }
    }
}

/// Outcome of startup reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: usize,
    pub purged_interrupted: usize,
    pub purged_missing: usize,
    pub purged_mismatched: usize,
    pub adopted: usize,
    pub duplicates_removed: usize,
}

/// Read the manifest; a missing or unreadable one yields no entries.
pub async fn load(path: &Path) -> Vec<VideoEntry> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read manifest, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Manifest>(&bytes) {
        Ok(manifest) => manifest.entries,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to parse manifest, rebuilding from directory");
            Vec::new()
        }
    }
}

/// Write the manifest through a temporary file and rename it into place.
pub async fn store(path: &Path, entries: Vec<VideoEntry>) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(&Manifest::new(entries))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let temp_path = path.with_extension("json.tmp");
    if let Err(e) = fs::write(&temp_path, &json).await {
        warn!(path = ?temp_path, error = %e, "Failed to write manifest");
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        warn!(from = ?temp_path, to = ?path, error = %e, "Failed to rename manifest");
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    Ok(())
}

/// Bring the loaded entries in line with what is actually on disk.
pub async fn reconcile(
    storage_dir: &Path,
    entries: Vec<VideoEntry>,
) -> io::Result<(HashMap<VideoId, VideoEntry>, ReconcileReport)> {
    let mut report = ReconcileReport::default();
    let mut kept: HashMap<VideoId, VideoEntry> = HashMap::with_capacity(entries.len());

    for entry in entries {
        match entry.status {
            VideoStatus::Pending | VideoStatus::Downloading => {
                debug!(id = %entry.id, "Discarding interrupted download");
                report.purged_interrupted += 1;
            }
            VideoStatus::Failed => {
                kept.insert(entry.id.clone(), entry);
            }
            VideoStatus::Ready => {
                let Some(path) = entry.file_path.clone() else {
                    report.purged_missing += 1;
                    continue;
                };
                match fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() && meta.len() == entry.size_bytes => {
                        kept.insert(entry.id.clone(), entry);
                    }
                    Ok(meta) if meta.is_file() => {
                        warn!(
                            id = %entry.id,
                            expected = entry.size_bytes,
                            actual = meta.len(),
                            "Cached file size mismatch, discarding"
                        );
                        let _ = fs::remove_file(&path).await;
                        report.purged_mismatched += 1;
                    }
                    _ => {
                        debug!(id = %entry.id, path = ?path, "Cached file missing, purging entry");
                        report.purged_missing += 1;
                    }
                }
            }
        }
    }

    // Leftovers of downloads that never finished
    let staging = storage_dir.join(STAGING_DIR);
    match fs::remove_dir_all(&staging).await {
        Ok(()) => debug!(path = ?staging, "Removed stale staging directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?staging, error = %e, "Failed to clear staging directory"),
    }

    // at most one file per id survives
    let mut strays: HashMap<VideoId, (PathBuf, u64, DateTime<Utc>)> = HashMap::new();
    let mut duplicates = Vec::new();

    let mut dir = fs::read_dir(storage_dir).await?;
    while let Some(dirent) = dir.next_entry().await? {
        let path = dirent.path();
        let Some((id, _ext)) = media_file_id(&path) else {
            continue;
        };
        let meta = match dirent.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        if let Some(tracked) = kept.get(&id).filter(|e| e.is_ready()) {
            if tracked.file_path.as_deref() != Some(path.as_path()) {
                duplicates.push(path);
            }
            continue;
        }

        let modified: DateTime<Utc> = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        match strays.get(&id) {
            Some((_, _, seen)) if *seen >= modified => duplicates.push(path),
            _ => {
                if let Some((older, _, _)) = strays.insert(id, (path, meta.len(), modified)) {
                    duplicates.push(older);
                }
            }
        }
    }

    for path in duplicates {
        warn!(path = ?path, "Removing duplicate cached file");
        match fs::remove_file(&path).await {
            Ok(()) => report.duplicates_removed += 1,
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove duplicate cached file"),
        }
    }

    for (id, (path, size_bytes, touched)) in strays {
        info!(id = %id, path = ?path, "Adopting cached file without manifest entry");
        kept.insert(
            id.clone(),
            VideoEntry {
                source_url: id.canonical_url(),
                file_path: Some(path),
                size_bytes,
                status: VideoStatus::Ready,
                last_accessed_at: touched,
                created_at: touched,
                last_error: None,
                id,
            },
        );
        report.adopted += 1;
    }

    report.kept = kept.len() - report.adopted;
    Ok((kept, report))
}

/// `<id>.<media ext>` files in the storage root
pub fn media_file_id(path: &Path) -> Option<(VideoId, String)> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') || file_name == MANIFEST_FILE {
        return None;
    }
    let (stem, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    VideoId::parse(stem).ok().map(|id| (id, ext))
}

/// Final location of a cached file
pub fn media_path(storage_dir: &Path, id: &VideoId, ext: &str) -> PathBuf {
    storage_dir.join(format!("{id}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> VideoId {
        VideoId::parse(raw).unwrap()
    }

    fn ready(dir: &Path, raw: &str, size: u64) -> VideoEntry {
        VideoEntry::pending(id(raw), format!("https://youtu.be/{raw}"))
            .into_downloading()
            .into_ready(media_path(dir, &id(raw), "webm"), size)
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let entry = ready(dir.path(), "abc123", 3);

        store(&path, vec![entry.clone()]).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load(&path).await, vec![entry]);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load(&path).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_purges_and_adopts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // intact
        std::fs::write(root.join("keep.webm"), b"abc").unwrap();
        let keep = ready(root, "keep", 3);
        // row without file
        let missing = ready(root, "missing", 10);
        // file truncated since the row was written
        std::fs::write(root.join("short.webm"), b"a").unwrap();
        let short = ready(root, "short", 5);
        // interrupted
        let interrupted =
            VideoEntry::pending(id("inflight"), "https://youtu.be/inflight").into_downloading();
        // failed rows survive
        let failed = VideoEntry::pending(id("broken"), "https://youtu.be/broken")
            .into_downloading()
            .into_failed("boom");
        // stray file from an older install
        std::fs::write(root.join("stray.mp4"), b"12345").unwrap();
        std::fs::write(root.join("notes.txt"), b"ignored").unwrap();
        std::fs::create_dir_all(root.join(STAGING_DIR).join("inflight")).unwrap();
        std::fs::write(root.join(STAGING_DIR).join("inflight/inflight.webm.part"), b"x").unwrap();

        let (entries, report) =
            reconcile(root, vec![keep, missing, short, interrupted, failed])
                .await
                .unwrap();

        assert_eq!(report.purged_interrupted, 1);
        assert_eq!(report.purged_missing, 1);
        assert_eq!(report.purged_mismatched, 1);
        assert_eq!(report.adopted, 1);
        assert_eq!(report.kept, 2);

        assert!(entries[&id("keep")].is_ready());
        assert_eq!(entries[&id("broken")].status, VideoStatus::Failed);
        let stray = &entries[&id("stray")];
        assert_eq!(stray.size_bytes, 5);
        assert_eq!(stray.file_path.as_deref(), Some(root.join("stray.mp4").as_path()));
        assert!(!entries.contains_key(&id("inflight")));
        assert!(!root.join("short.webm").exists());
        assert!(!root.join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_one_file_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(600);

        std::fs::write(root.join("dup.webm"), b"older").unwrap();
        std::fs::File::options()
            .write(true)
            .open(root.join("dup.webm"))
            .unwrap()
            .set_modified(old)
            .unwrap();
        std::fs::write(root.join("dup.mp4"), b"newer!").unwrap();

        // tracked row wins over an untracked copy in another container
        std::fs::write(root.join("keep.webm"), b"abc").unwrap();
        std::fs::write(root.join("keep.mkv"), b"stale").unwrap();

        let (entries, report) = reconcile(root, vec![ready(root, "keep", 3)]).await.unwrap();

        assert_eq!(report.adopted, 1);
        assert_eq!(report.duplicates_removed, 2);
        let dup = &entries[&id("dup")];
        assert_eq!(dup.file_path.as_deref(), Some(root.join("dup.mp4").as_path()));
        assert_eq!(dup.size_bytes, 6);
        assert!(!root.join("dup.webm").exists());
        assert!(root.join("keep.webm").exists());
        assert!(!root.join("keep.mkv").exists());
    }

    #[test]
    fn test_media_file_id() {
        assert_eq!(
            media_file_id(Path::new("/v/abc123.webm")).map(|(id, _)| id.to_string()),
            Some("abc123".to_string())
        );
        assert!(media_file_id(Path::new("/v/manifest.json")).is_none());
        assert!(media_file_id(Path::new("/v/abc123.webm.part")).is_none());
        assert!(media_file_id(Path::new("/v/.staging")).is_none());
    }
}
