//! # Fetch tool
//!
//! Boundary to the external program that actually retrieves media. The
//! orchestrator only sees the [`FetchTool`] trait; [`YtDlp`] drives a
//! yt-dlp compatible executable as a subprocess.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broadcast::ProgressUpdate;
use crate::error::EngineError;
use crate::source::VideoId;

pub mod cookies;
pub mod progress;
mod ytdlp;

pub use cookies::{Cookies, CookiesSource, StaticCookies};
pub use ytdlp::YtDlp;

/// Callback receiving progress as the tool reports it.
pub type OnProgress = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// One fetch tool invocation
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: VideoId,
    /// URL handed to the tool
    pub url: String,
    /// Private directory the tool writes into; moved into place by the caller
    pub output_dir: PathBuf,
    /// Signed-in session for age-restricted videos
    pub cookies: Option<Cookies>,
}

#[async_trait]
pub trait FetchTool: Send + Sync {
    /// Check that the tool can be invoked at all. Returns its version string.
    async fn version(&self) -> Result<String, EngineError>;

    /// Download one video into `request.output_dir` and return the produced file.
    async fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: OnProgress,
        cancel: CancellationToken,
    ) -> Result<PathBuf, EngineError>;
}

/// Tool output that means the video needs a signed-in session
pub fn is_age_restriction_error(message: &str) -> bool {
    message.contains("Sign in to confirm your age")
        || message.contains("age-restricted")
        || message.contains("confirm your age")
        || message.contains("inappropriate for some users")
        || message.contains("--cookies-from-browser")
}

/// Tool output that means the disk filled up
pub fn is_storage_full_error(message: &str) -> bool {
    message.contains("No space left on device") || message.contains("There is not enough space")
}
