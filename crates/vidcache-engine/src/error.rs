use serde::Serialize;

// Error type for cache and download operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Fetch tool unavailable: {0}")]
    ToolMissing(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Stable classification of an [`EngineError`], carried on failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidSource,
    ToolMissing,
    DownloadFailed,
    StorageFull,
    NotFound,
    Io,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidSource(_) => ErrorKind::InvalidSource,
            EngineError::ToolMissing(_) => ErrorKind::ToolMissing,
            EngineError::DownloadFailed(_) => ErrorKind::DownloadFailed,
            EngineError::StorageFull(_) => ErrorKind::StorageFull,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                ErrorKind::StorageFull
            }
            EngineError::Io(_) | EngineError::Manifest(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
