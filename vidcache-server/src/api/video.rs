use std::convert::Infallible;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vidcache_engine::{
    DownloadTicket, ErrorKind, ProgressEvent, Subscription, TerminalEvent, VideoId, VideoStatus,
};

use super::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct VideoQuery {
    url: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileUrlBody {
    file_url: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum CompleteBody {
    #[serde(rename_all = "camelCase")]
    Ready { file_url: String, size_bytes: u64 },
    Failed { error: String, kind: ErrorKind },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: VideoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `GET /video?url=<source>` or `?id=<videoId>`
///
/// A cached video answers with its file URL; otherwise the response is an
/// SSE stream of the (possibly shared) download's progress.
pub async fn request_video(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Response> {
    let source = query
        .url
        .or(query.id)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("missing 'url' or 'id' query parameter"))?;

    match state.orchestrator.request_download(&source).await? {
        DownloadTicket::Cached(entry) => Ok(Json(FileUrlBody {
            file_url: state.file_url(&entry.id),
        })
        .into_response()),
        DownloadTicket::InFlight(subscription) => {
            debug!(id = %subscription.id(), "Streaming download progress");
            Ok(Sse::new(progress_events(state, subscription))
                .keep_alive(KeepAlive::default())
                .into_response())
        }
    }
}

fn progress_events(
    state: AppState,
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    subscription.map(move |event| Ok(to_sse_event(&state, event)))
}

fn to_sse_event(state: &AppState, event: ProgressEvent) -> Event {
    match event {
        ProgressEvent::Progress(update) => Event::default()
            .event("progress")
            .data(to_json(&update)),
        ProgressEvent::Terminal(terminal) => {
            let body = match terminal {
                TerminalEvent::Ready { id, size_bytes, .. } => CompleteBody::Ready {
                    file_url: state.file_url(&id),
                    size_bytes,
                },
                TerminalEvent::Failed { kind, message, .. } => CompleteBody::Failed {
                    error: message,
                    kind,
                },
            };
            Event::default().event("complete").data(to_json(&body))
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// `GET /video/status?id=<id>`
pub async fn video_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = VideoId::from_source(&query.id)?;
    let report = state
        .orchestrator
        .status(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown video '{id}'")))?;

    let body = StatusBody {
        file_url: (report.status == VideoStatus::Ready).then(|| state.file_url(&id)),
        status: report.status,
        percent: report.percent,
        error: report.last_error,
    };
    serde_json::to_value(body)
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}
