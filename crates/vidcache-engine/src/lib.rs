//! # vidcache engine
//!
//! Local video cache with deduplicated downloads.
//!
//! Videos are fetched by an external yt-dlp compatible tool, stored under
//! one directory and tracked in a JSON manifest. Concurrent requests for the
//! same video share a single download and observe its progress through a
//! broadcast session. An eviction manager keeps the cache under a size
//! ceiling by dropping the least recently used files.
//!
//! ## Features
//!
//! - Video id derivation from the common YouTube URL shapes
//! - Per-video singleton downloads with live progress fan-out
//! - Durable cache index with startup reconciliation
//! - LRU eviction that never removes a file while it is being served

pub mod broadcast;
pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod eviction;
pub mod fetch;
pub mod orchestrator;
pub mod source;

pub use builder::EngineConfigBuilder;
pub use config::{DEFAULT_EXTRACTOR_ARGS, DEFAULT_FORMAT_SELECTOR, EngineConfig};
pub use error::{EngineError, ErrorKind};

pub use broadcast::{DownloadSession, ProgressEvent, ProgressUpdate, Subscription, TerminalEvent};
pub use cache::{CacheIndex, CacheUsage, ReadLease, VideoEntry, VideoStatus};
pub use eviction::{CacheLimit, EvictionManager, EvictionReport, EvictionTrigger, StaticLimit};
pub use fetch::{Cookies, CookiesSource, FetchRequest, FetchTool, OnProgress, StaticCookies, YtDlp};
pub use orchestrator::{DownloadOrchestrator, DownloadTicket, VideoStatusReport};
pub use source::VideoId;
