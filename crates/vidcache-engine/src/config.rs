use std::path::PathBuf;
use std::time::Duration;

/// Format selector: best video-only stream up to 1080p, WebM preferred.
pub const DEFAULT_FORMAT_SELECTOR: &str =
    "bestvideo[height<=1080][ext=webm]/bestvideo[height<=1080]/bestvideo[ext=webm]/bestvideo";

/// Extractor arguments selecting the web player client, which needs no JavaScript runtime.
pub const DEFAULT_EXTRACTOR_ARGS: &str = "youtube:player_client=web";

/// Configurable options for the cache engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding cached media files and the manifest
    pub storage_dir: PathBuf,

    /// Path to the external fetch tool executable
    pub tool_path: PathBuf,

    /// Format selector passed to the fetch tool
    pub format_selector: String,

    /// Upper bound on a single fetch tool invocation
    pub fetch_timeout: Duration,

    /// Upper bound on the startup `--version` check
    pub version_timeout: Duration,

    /// Buffered progress events per session before slow subscribers drop updates
    pub progress_capacity: usize,

    /// Interval between periodic eviction passes
    pub eviction_interval: Duration,

    /// Passed as `--extractor-args` when set
    pub extractor_args: Option<String>,

    /// Browsers whose cookies are tried, in order, for age-restricted videos
    pub cookie_browsers: Vec<String>,

    /// Extra arguments appended to every fetch tool invocation
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: std::env::temp_dir().join("vidcache"),
            tool_path: PathBuf::from("yt-dlp"),
            format_selector: DEFAULT_FORMAT_SELECTOR.to_owned(),
            fetch_timeout: Duration::from_secs(30 * 60),
            version_timeout: Duration::from_secs(15),
            progress_capacity: 64,
            eviction_interval: Duration::from_secs(10 * 60),
            extractor_args: Some(DEFAULT_EXTRACTOR_ARGS.to_owned()),
            cookie_browsers: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> crate::builder::EngineConfigBuilder {
        crate::builder::EngineConfigBuilder::new()
    }
}
