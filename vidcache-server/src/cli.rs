use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Local video cache and download server",
    long_about = "Serves cached videos over HTTP and downloads missing ones on demand.\n\
                  \n\
                  Concurrent requests for the same video share one download and receive\n\
                  its progress as Server-Sent Events. The cache directory is kept under a\n\
                  size limit by evicting the least recently used videos."
)]
pub struct CliArgs {
    /// Address to bind
    #[arg(
        long,
        env = "VIDCACHE_HOST",
        default_value = "127.0.0.1",
        help = "Interface the HTTP server listens on"
    )]
    pub host: String,

    /// Port to bind
    #[arg(
        short,
        long,
        env = "VIDCACHE_PORT",
        default_value_t = 15123,
        help = "Port the HTTP server listens on"
    )]
    pub port: u16,

    /// Directory for cached videos
    #[arg(
        short = 'o',
        long,
        env = "VIDCACHE_STORAGE_DIR",
        help = "Directory holding cached videos and the manifest (default: videoFolder from the settings file, else a temp directory)"
    )]
    pub storage_dir: Option<PathBuf>,

    /// Settings file shared with the desktop shell
    #[arg(
        short = 's',
        long,
        env = "VIDCACHE_SETTINGS",
        help = "JSON settings file providing videoFolder, maxCacheGB and cookiesFile. maxCacheGB is re-read on every eviction pass."
    )]
    pub settings_file: Option<PathBuf>,

    /// Cache size limit with optional unit (B, KB, MB, GB, TB)
    #[arg(
        short = 'm',
        long,
        env = "VIDCACHE_MAX_CACHE",
        help = "Cache size limit used when the settings file has no maxCacheGB. Examples: \"10GB\", \"500MB\". Use 0 for unlimited. (default: 10GB)"
    )]
    pub max_cache: Option<String>,

    /// Path to the fetch tool
    #[arg(
        long,
        env = "VIDCACHE_TOOL",
        default_value = "yt-dlp",
        help = "Path to a yt-dlp compatible executable"
    )]
    pub tool: PathBuf,

    /// Upper bound on one download
    #[arg(
        long,
        default_value = "30m",
        help = "Maximum time a single download may take, with optional unit (s, m, h). Use 0 for unlimited."
    )]
    pub fetch_timeout: String,

    /// Interval between periodic eviction passes
    #[arg(
        long,
        default_value = "10m",
        help = "Interval between periodic eviction passes, with optional unit (s, m, h)"
    )]
    pub eviction_interval: String,

    /// Base URL used when building file links
    #[arg(
        long,
        env = "VIDCACHE_PUBLIC_URL",
        help = "Base URL clients use to reach this server (default: http://<host>:<port>)"
    )]
    pub public_base_url: Option<String>,

    /// cookies.txt for age-restricted videos
    #[arg(
        long,
        env = "VIDCACHE_COOKIES",
        help = "cookies.txt used to retry age-restricted videos (default: cookiesFile from the settings file, re-read on every retry)"
    )]
    pub cookies_file: Option<PathBuf>,

    /// Browsers whose cookie stores are tried after the cookies file
    #[arg(
        long,
        env = "VIDCACHE_COOKIES_BROWSER",
        default_value = "auto",
        help = "Comma-separated browsers whose cookies are tried for age-restricted videos, \"auto\" for every installed browser, or \"none\""
    )]
    pub cookies_from_browser: String,

    /// Extractor arguments for the fetch tool
    #[arg(
        long,
        env = "VIDCACHE_EXTRACTOR_ARGS",
        default_value = vidcache_engine::DEFAULT_EXTRACTOR_ARGS,
        help = "Value of --extractor-args passed to the fetch tool. Empty to omit."
    )]
    pub extractor_args: String,

    /// Extra arguments for the fetch tool
    #[arg(
        long = "tool-arg",
        allow_hyphen_values = true,
        help = "Extra argument appended to every fetch tool invocation (can be repeated)"
    )]
    pub tool_args: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Mirror logs to a file
    #[arg(long, env = "VIDCACHE_LOG_FILE", help = "Also write logs to this file")]
    pub log_file: Option<PathBuf>,
}
