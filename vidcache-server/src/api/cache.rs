use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::{ApiResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBody {
    total_bytes: u64,
    /// `0` means unlimited
    limit_bytes: u64,
    entries: usize,
    active_downloads: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearBody {
    evicted: usize,
    freed_bytes: u64,
    deferred: usize,
    /// Entries whose files could not be deleted
    failed: usize,
}

/// `GET /cache/usage`
pub async fn usage(State(state): State<AppState>) -> Json<UsageBody> {
    let usage = state.index.usage();
    Json(UsageBody {
        total_bytes: usage.total_bytes,
        limit_bytes: state.eviction.current_limit().await,
        entries: usage.ready_entries,
        active_downloads: state.orchestrator.active_sessions(),
    })
}

/// `DELETE /cache`
pub async fn clear(State(state): State<AppState>) -> ApiResult<Json<ClearBody>> {
    let report = state.eviction.clear().await?;
    Ok(Json(ClearBody {
        evicted: report.evicted.len(),
        freed_bytes: report.freed_bytes,
        deferred: report.deferred.len(),
        failed: report.failed.len(),
    }))
}
