//! # Builder for EngineConfig
//!
//! Fluent construction of [`EngineConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use vidcache_engine::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .with_storage_dir("/tmp/videos")
//!     .with_tool_path("/usr/local/bin/yt-dlp")
//!     .with_fetch_timeout(Duration::from_secs(600))
//!     .build();
//!
//! assert_eq!(config.fetch_timeout, Duration::from_secs(600));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::EngineConfig;

/// Builder for creating EngineConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = dir.into();
        self
    }

    pub fn with_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tool_path = path.into();
        self
    }

    pub fn with_format_selector(mut self, selector: impl Into<String>) -> Self {
        self.config.format_selector = selector.into();
        self
    }

    /// Set the upper bound for one fetch tool run; zero disables the bound
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.config.version_timeout = timeout;
        self
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.config.progress_capacity = capacity.max(1);
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.config.eviction_interval = interval;
        self
    }

    /// Override the extractor arguments; `None` omits the flag
    pub fn with_extractor_args(mut self, args: Option<String>) -> Self {
        self.config.extractor_args = args;
        self
    }

    pub fn with_cookie_browsers<I, S>(mut self, browsers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.cookie_browsers = browsers.into_iter().map(Into::into).collect();
        self
    }

    /// Append one extra argument for the fetch tool
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.extra_args.push(arg.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
