//! # Video sources
//!
//! Derives the stable [`VideoId`] used as cache key and dedup key from a
//! caller supplied URL. URL variants that point at the same video
//! (short links, embeds, shorts, reordered or tracking query parameters)
//! all collapse to the same id.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::EngineError;

const MAX_ID_LEN: usize = 20;

/// Path prefixes under which the video id is the next path segment.
const ID_PATH_PREFIXES: &[&str] = &["shorts", "embed", "live", "v", "e"];

/// Canonical identifier of a source video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    /// Validate a bare id.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let raw = raw.trim();
        if is_valid_id(raw) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(EngineError::InvalidSource(format!(
                "'{raw}' is not a valid video id"
            )))
        }
    }

    /// Derive the id from a source URL, or accept a bare id.
    pub fn from_source(source: &str) -> Result<Self, EngineError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(EngineError::InvalidSource("empty source".to_string()));
        }

        if is_valid_id(source) {
            return Ok(Self(source.to_owned()));
        }

        let url = parse_loose(source)?;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
            .ok_or_else(|| EngineError::InvalidSource(format!("{source}: missing host")))?;

        let candidate = if host == "youtu.be" {
            url.path_segments()
                .and_then(|mut segments| segments.next())
                .map(str::to_owned)
        } else if is_youtube_host(&host) {
            id_from_youtube_url(&url)
        } else {
            return Err(EngineError::InvalidSource(format!(
                "{source}: unsupported host '{host}'"
            )));
        };

        match candidate {
            Some(id) if is_valid_id(&id) => Ok(Self(id)),
            _ => Err(EngineError::InvalidSource(format!(
                "{source}: no video id found"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The canonical watch URL handed to the fetch tool.
    pub fn canonical_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VideoId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VideoId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}

fn is_valid_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn is_youtube_host(host: &str) -> bool {
    matches!(
        host,
        "youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtube-nocookie.com"
    )
}

// Accept scheme-less input such as "youtube.com/watch?v=..."
fn parse_loose(source: &str) -> Result<Url, EngineError> {
    match Url::parse(source) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{source}"))
            .map_err(|e| EngineError::InvalidSource(format!("{source}: {e}"))),
        Err(e) => Err(EngineError::InvalidSource(format!("{source}: {e}"))),
    }
}

fn id_from_youtube_url(url: &Url) -> Option<String> {
    if let Some((_, v)) = url.query_pairs().find(|(key, _)| key == "v") {
        return Some(v.into_owned());
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let first = segments.next()?;
    if ID_PATH_PREFIXES.contains(&first) {
        segments.next().map(str::to_owned)
    } else {
        None
    }
}
