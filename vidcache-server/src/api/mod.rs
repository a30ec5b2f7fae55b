//! HTTP surface of the cache.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /health` | liveness |
//! | `GET /video?url=` or `?id=` | cache hit as JSON, otherwise an SSE progress stream |
//! | `GET /video/status?id=` | point-in-time status |
//! | `GET /video/files/{id}` | the cached file, with range support |
//! | `GET /cache/usage` | bytes used against the limit |
//! | `DELETE /cache` | evict everything not being served |

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vidcache_engine::{CacheIndex, DownloadOrchestrator, EvictionManager, VideoId};

mod cache;
mod error;
mod files;
mod video;

pub use error::{ApiError, ApiResult};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DownloadOrchestrator>,
    pub index: Arc<CacheIndex>,
    /// Also the source of the current cache limit
    pub eviction: Arc<EvictionManager>,
    pub public_base_url: Arc<str>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<DownloadOrchestrator>,
        eviction: Arc<EvictionManager>,
        public_base_url: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            index: orchestrator.index().clone(),
            orchestrator,
            eviction,
            public_base_url: public_base_url.into(),
        }
    }

    /// URL a client fetches a cached video from
    pub fn file_url(&self, id: &VideoId) -> String {
        format!("{}/video/files/{}", self.public_base_url, id)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/video", get(video::request_video))
        // older clients
        .route("/video/request", get(video::request_video))
        .route("/video/status", get(video::video_status))
        .route("/video/files/{file}", get(files::serve_file))
        .route("/cache/usage", get(cache::usage))
        .route("/cache", delete(cache::clear))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}
