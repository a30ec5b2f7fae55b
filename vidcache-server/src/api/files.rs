use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use vidcache_engine::{ReadLease, VideoId};

use super::{ApiError, ApiResult, AppState};

/// `GET /video/files/{id}`, also accepting `{id}.{ext}`
///
/// The entry stays leased until the response body is dropped, so eviction
/// cannot remove a file while it is being sent. An entry whose file has
/// disappeared is dropped from the index.
pub async fn serve_file(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let stem = file.split_once('.').map_or(file.as_str(), |(stem, _)| stem);
    let id = VideoId::parse(stem).map_err(|_| ApiError::not_found("file not found"))?;

    let (entry, lease) = state
        .index
        .acquire_lease(&id)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    let path = entry
        .file_path
        .ok_or_else(|| ApiError::not_found("file not found"))?;

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            drop(lease);
            warn!(id = %id, path = ?path, "Cached file is missing, dropping entry");
            let guard = state.index.lock(&id).await;
            state.index.verify_ready(&guard).await?;
            return Err(ApiError::not_found("file not found"));
        }
        Err(e) => return Err(ApiError::internal(e.to_string())),
    };

    debug!(id = %id, path = ?path, "Serving cached file");
    stream_file(file, &path, headers.get(header::RANGE), lease).await
}

async fn stream_file(
    mut file: File,
    path: &Path,
    range: Option<&HeaderValue>,
    lease: ReadLease,
) -> ApiResult<Response> {
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let range = range.and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes */{size}"));
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
            let stream = LeasedStream::new(ReaderStream::new(file.take(length)), lease);
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{size}"),
            );
            insert_header(&mut response, header::CONTENT_LENGTH, length.to_string());
            response
        }
        None => {
            let stream = LeasedStream::new(ReaderStream::new(file), lease);
            let mut response = Body::from_stream(stream).into_response();
            insert_header(&mut response, header::CONTENT_LENGTH, size.to_string());
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type(path)),
    );
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("webm") => "video/webm",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Parse a single `bytes=` range. Unsupported or malformed ranges yield `None`
/// and the whole file is sent.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        // suffix range: last N bytes
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

/// Body stream that keeps the file's read lease alive until the body is dropped
struct LeasedStream<S> {
    inner: S,
    _lease: ReadLease,
}

impl<S> LeasedStream<S> {
    fn new(inner: S, lease: ReadLease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl<S: Stream + Unpin> Stream for LeasedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
