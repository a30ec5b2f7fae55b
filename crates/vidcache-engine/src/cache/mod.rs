//! # Cache System
//!
//! Tracks cached videos on disk: the index itself, its manifest, per-video
//! locks shared with the orchestrator and eviction, and read leases held
//! while files are served.

mod index;
mod lease;
mod locks;
pub mod manifest;
mod types;

/// Manifest file name inside the storage directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory under the storage root where in-flight downloads are written
pub const STAGING_DIR: &str = ".staging";

pub use index::CacheIndex;
pub use lease::{LeaseTable, ReadLease};
pub use locks::{KeyGuard, KeyedLocks};
pub use manifest::ReconcileReport;
pub use types::{CacheUsage, VideoEntry, VideoStatus};
