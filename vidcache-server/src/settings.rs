//! Settings file shared with the desktop shell.
//!
//! Only three values are read: the video folder, the cache limit in GB and
//! the cookies file. The limit is looked up again on every eviction pass and
//! the cookies file on every age-restricted retry, so changes made in the
//! shell apply without a restart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use vidcache_engine::{CacheLimit, CookiesSource};

use crate::error::AppError;
use crate::utils::GIB;

/// Cache limit used when neither the settings file nor the CLI sets one
pub const DEFAULT_LIMIT_BYTES: u64 = 10 * GIB;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default, rename = "videoFolder")]
    pub video_folder: Option<String>,

    #[serde(default, rename = "maxCacheGB")]
    pub max_cache_gb: Option<u64>,

    #[serde(default, rename = "cookiesFile")]
    pub cookies_file: Option<String>,
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self, AppError> {
        let content = tokio::fs::read(path).await?;
        serde_json::from_slice(&content)
            .map_err(|e| AppError::Settings(format!("{}: {e}", path.display())))
    }

    pub fn video_folder(&self) -> Option<PathBuf> {
        non_empty(&self.video_folder).map(PathBuf::from)
    }

    pub fn cookies_file(&self) -> Option<PathBuf> {
        non_empty(&self.cookies_file).map(PathBuf::from)
    }

    pub fn max_cache_bytes(&self) -> Option<u64> {
        self.max_cache_gb.map(|gb| gb.saturating_mul(GIB))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Cache limit read from the settings file on every call
#[derive(Debug, Clone)]
pub struct SettingsFileLimit {
    path: Option<PathBuf>,
    fallback: u64,
}

impl SettingsFileLimit {
    pub fn new(path: Option<PathBuf>, fallback: u64) -> Self {
        Self { path, fallback }
    }
}

#[async_trait]
impl CacheLimit for SettingsFileLimit {
    async fn max_cache_bytes(&self) -> u64 {
        let Some(path) = &self.path else {
            return self.fallback;
        };
        match Settings::load(path).await {
            Ok(settings) => match settings.max_cache_bytes() {
                Some(limit) => {
                    debug!(limit, "Cache limit from settings file");
                    limit
                }
                None => self.fallback,
            },
            Err(e) => {
                warn!(error = %e, fallback = self.fallback, "Could not read cache limit from settings");
                self.fallback
            }
        }
    }
}

/// Cookies file read from the settings file on every call, unless pinned on the command line
#[derive(Debug, Clone)]
pub struct SettingsFileCookies {
    path: Option<PathBuf>,
    pinned: Option<PathBuf>,
}

impl SettingsFileCookies {
    pub fn new(path: Option<PathBuf>, pinned: Option<PathBuf>) -> Self {
        Self { path, pinned }
    }
}

#[async_trait]
impl CookiesSource for SettingsFileCookies {
    async fn cookies_file(&self) -> Option<PathBuf> {
        if let Some(pinned) = &self.pinned {
            return Some(pinned.clone());
        }
        let path = self.path.as_ref()?;
        match Settings::load(path).await {
            Ok(settings) => settings.cookies_file(),
            Err(e) => {
                warn!(error = %e, "Could not read cookies file from settings");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_follows_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let limit = SettingsFileLimit::new(Some(path.clone()), 123);

        // missing file
        assert_eq!(limit.max_cache_bytes().await, 123);

        std::fs::write(&path, r#"{"videoFolder": "", "maxCacheGB": 2}"#).unwrap();
        assert_eq!(limit.max_cache_bytes().await, 2 * GIB);

        std::fs::write(&path, r#"{"maxCacheGB": 5, "language": "en"}"#).unwrap();
        assert_eq!(limit.max_cache_bytes().await, 5 * GIB);

        std::fs::write(&path, r#"{"setupComplete": true}"#).unwrap();
        assert_eq!(limit.max_cache_bytes().await, 123);

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(limit.max_cache_bytes().await, 123);
    }

    #[tokio::test]
    async fn test_cookies_follow_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cookies = SettingsFileCookies::new(Some(path.clone()), None);
        assert_eq!(cookies.cookies_file().await, None);

        std::fs::write(&path, r#"{"cookiesFile": "/home/u/cookies.txt"}"#).unwrap();
        assert_eq!(cookies.cookies_file().await, Some(PathBuf::from("/home/u/cookies.txt")));

        std::fs::write(&path, r#"{"cookiesFile": "/home/u/fresh.txt"}"#).unwrap();
        assert_eq!(cookies.cookies_file().await, Some(PathBuf::from("/home/u/fresh.txt")));

        let pinned = SettingsFileCookies::new(Some(path), Some(PathBuf::from("/etc/cookies.txt")));
        assert_eq!(pinned.cookies_file().await, Some(PathBuf::from("/etc/cookies.txt")));
        assert_eq!(SettingsFileCookies::new(None, None).cookies_file().await, None);
    }

    #[tokio::test]
    async fn test_settings_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"videoFolder": "/data/videos", "cookiesFile": "  ", "maxCacheGB": 0}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).await.unwrap();
        assert_eq!(settings.video_folder(), Some(PathBuf::from("/data/videos")));
        assert_eq!(settings.cookies_file(), None);
        assert_eq!(settings.max_cache_bytes(), Some(0));
    }
}
