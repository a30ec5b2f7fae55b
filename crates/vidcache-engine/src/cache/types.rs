//! # Cache Types
//!
//! Records kept by the cache index and persisted in the manifest.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::VideoId;

/// Lifecycle state of a cached video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    /// Entry created, fetch tool not started yet
    Pending,
    /// Fetch tool running
    Downloading,
    /// File complete and servable
    Ready,
    /// Last attempt failed, see `last_error`
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Downloading => "downloading",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VideoStatus::Ready | VideoStatus::Failed)
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// A terminal state may restart a new cycle at `Pending`.
    pub fn can_transition_to(&self, next: VideoStatus) -> bool {
        use VideoStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Ready)
                | (Downloading, Failed)
                | (Pending, Failed)
                | (Failed, Pending)
                | (Ready, Pending)
        )
    }
}

/// One row per distinct source video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEntry {
    pub id: VideoId,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub size_bytes: u64,
    pub status: VideoStatus,
    pub last_accessed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl VideoEntry {
    /// Fresh `Pending` entry for a new download cycle
    pub fn pending(id: VideoId, source_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_url: source_url.into(),
            file_path: None,
            size_bytes: 0,
            status: VideoStatus::Pending,
            last_accessed_at: now,
            created_at: now,
            last_error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == VideoStatus::Ready
    }

    pub fn into_downloading(mut self) -> Self {
        debug_assert!(self.status.can_transition_to(VideoStatus::Downloading));
        self.status = VideoStatus::Downloading;
        self
    }

    pub fn into_ready(mut self, file_path: PathBuf, size_bytes: u64) -> Self {
        debug_assert!(self.status.can_transition_to(VideoStatus::Ready));
        self.status = VideoStatus::Ready;
        self.file_path = Some(file_path);
        self.size_bytes = size_bytes;
        self.last_accessed_at = Utc::now();
        self.last_error = None;
        self
    }

    pub fn into_failed(mut self, error: impl Into<String>) -> Self {
        debug_assert!(self.status.can_transition_to(VideoStatus::Failed));
        self.status = VideoStatus::Failed;
        self.file_path = None;
        self.size_bytes = 0;
        self.last_error = Some(error.into());
        self
    }
}

/// Aggregate disk usage of the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheUsage {
    pub total_bytes: u64,
    pub ready_entries: usize,
}
