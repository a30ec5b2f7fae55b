use std::fmt;
use std::path::PathBuf;

use tracing::{info, warn};
use vidcache_engine::EngineConfig;
use vidcache_engine::fetch::cookies::detect_browsers;

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::settings::{DEFAULT_LIMIT_BYTES, Settings, SettingsFileCookies};
use crate::utils::{format_bytes, parse_size, parse_time};

/// Configuration for the whole server, resolved from CLI flags and the settings file
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Base of the `fileUrl` values handed to clients, without trailing slash
    pub public_base_url: String,

    /// Settings file re-read for the cache limit
    pub settings_file: Option<PathBuf>,

    /// Limit used when the settings file has none
    pub fallback_limit: u64,

    /// Cookies file given on the command line, used instead of the settings file's
    pub cookies_file: Option<PathBuf>,

    pub engine: EngineConfig,
}

impl ServerConfig {
    pub async fn resolve(args: &CliArgs) -> Result<Self, AppError> {
        let settings = match &args.settings_file {
            Some(path) if path.exists() => Settings::load(path).await?,
            Some(path) => {
                warn!(path = ?path, "Settings file not found, using defaults");
                Settings::default()
            }
            None => Settings::default(),
        };

        let fallback_limit = match &args.max_cache {
            Some(raw) => parse_size(raw)?,
            None => DEFAULT_LIMIT_BYTES,
        };

        let fetch_timeout = parse_time(&args.fetch_timeout)?;
        let eviction_interval = parse_time(&args.eviction_interval)?;
        if eviction_interval.is_zero() {
            return Err(AppError::InvalidInput(
                "eviction interval must be greater than zero".to_string(),
            ));
        }

        // checked again before every retry, a missing file only warns here
        if let Some(path) = args.cookies_file.clone().or_else(|| settings.cookies_file())
            && !path.exists()
        {
            warn!(path = ?path, "Cookies file not found, it will be skipped until it exists");
        }

        let extractor_args = Some(args.extractor_args.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);

        let mut builder = EngineConfig::builder()
            .with_tool_path(&args.tool)
            .with_fetch_timeout(fetch_timeout)
            .with_eviction_interval(eviction_interval)
            .with_extractor_args(extractor_args)
            .with_cookie_browsers(cookie_browsers(&args.cookies_from_browser));
        if let Some(dir) = args.storage_dir.clone().or_else(|| settings.video_folder()) {
            builder = builder.with_storage_dir(dir);
        }
        for arg in &args.tool_args {
            builder = builder.with_extra_arg(arg);
        }

        let public_base_url = args
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            host: args.host.clone(),
            port: args.port,
            public_base_url,
            settings_file: args.settings_file.clone(),
            fallback_limit,
            cookies_file: args.cookies_file.clone(),
            engine: builder.build(),
        })
    }

    /// Cookies file lookup handed to the orchestrator
    pub fn cookies_source(&self) -> SettingsFileCookies {
        SettingsFileCookies::new(self.settings_file.clone(), self.cookies_file.clone())
    }

    pub fn log_summary(&self) {
        info!("{self}");
        if let Some(path) = &self.settings_file {
            info!(path = ?path, "Cache limit follows maxCacheGB in the settings file");
        }
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = if self.fallback_limit == 0 {
            "unlimited".to_string()
        } else {
            format_bytes(self.fallback_limit)
        };
        write!(
            f,
            "listen={}:{}, storage={}, tool={}, limit={}, fetch_timeout={:?}, eviction_interval={:?}, cookies={}, browsers=[{}]",
            self.host,
            self.port,
            self.engine.storage_dir.display(),
            self.engine.tool_path.display(),
            limit,
            self.engine.fetch_timeout,
            self.engine.eviction_interval,
            match (&self.cookies_file, &self.settings_file) {
                (Some(path), _) => path.display().to_string(),
                (None, Some(_)) => "from settings".to_string(),
                (None, None) => "none".to_string(),
            },
            self.engine.cookie_browsers.join(","),
        )
    }
}

/// `auto` detects installed browsers, `none` disables them, anything else is a list
fn cookie_browsers(raw: &str) -> Vec<String> {
    match raw.trim() {
        "auto" => detect_browsers(),
        "none" | "" => Vec::new(),
        list => list
            .split(',')
            .map(|b| b.trim().to_ascii_lowercase())
            .filter(|b| !b.is_empty())
            .collect(),
    }
}
