//! # Download Orchestrator
//!
//! Turns "I want this video" into either a cache hit or a subscription to
//! the single in-flight download for that video.
//!
//! The decision between hit, join and start is made while holding the
//! video's lock from [`CacheIndex::lock`], so concurrent requests for one id
//! never start more than one fetch tool process. Different ids proceed in
//! parallel. A finishing download records its outcome, publishes the
//! terminal event and leaves the session map under the same lock.
//!
//! Age-restricted videos are retried with the cookies file and then with
//! each configured browser's cookie store. A download that runs out of disk
//! space triggers an eviction pass and is attempted once more.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs;
use tokio::io;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broadcast::{DownloadSession, Subscription, TerminalEvent};
use crate::cache::manifest::media_path;
use crate::cache::{CacheIndex, STAGING_DIR, VideoEntry, VideoStatus};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::eviction::EvictionManager;
use crate::fetch::cookies::is_browser_cookie_error;
use crate::fetch::{
    Cookies, CookiesSource, FetchRequest, FetchTool, OnProgress, is_age_restriction_error,
};
use crate::source::VideoId;

/// Answer to a download request
#[derive(Debug)]
pub enum DownloadTicket {
    /// Already on disk
    Cached(VideoEntry),
    /// Joined to the running (or just started) download
    InFlight(Subscription),
}

/// Point-in-time view of one video
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatusReport {
    pub id: VideoId,
    pub status: VideoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct DownloadOrchestrator {
    index: Arc<CacheIndex>,
    tool: Arc<dyn FetchTool>,
    config: EngineConfig,
    sessions: Mutex<HashMap<VideoId, Arc<DownloadSession>>>,
    eviction: Arc<EvictionManager>,
    cookies: Arc<dyn CookiesSource>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DownloadOrchestrator {
    pub fn new(
        index: Arc<CacheIndex>,
        tool: Arc<dyn FetchTool>,
        config: EngineConfig,
        eviction: Arc<EvictionManager>,
        cookies: Arc<dyn CookiesSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            tool,
            config,
            sessions: Mutex::new(HashMap::new()),
            eviction,
            cookies,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.index
    }

    /// Serve `source_url` from the cache, or join or start its download.
    pub async fn request_download(self: &Arc<Self>, source_url: &str) -> Result<DownloadTicket> {
        let id = VideoId::from_source(source_url)?;
        let guard = self.index.lock(&id).await;

        // a file removed behind our back turns the hit into a fresh download
        if let Some(entry) = self.index.verify_ready(&guard).await?
            && entry.is_ready()
        {
            let entry = self.index.touch(&id)?;
            debug!(id = %id, "Cache hit");
            return Ok(DownloadTicket::Cached(entry));
        }

        let existing = self.sessions.lock().get(&id).cloned();
        if let Some(session) = existing {
            debug!(id = %id, subscribers = session.subscriber_count(), "Joining in-flight download");
            return Ok(DownloadTicket::InFlight(session.subscribe()));
        }

        let entry = VideoEntry::pending(id.clone(), id.canonical_url());
        self.index.upsert(entry.clone()).await?;
        let entry = entry.into_downloading();
        self.index.upsert(entry.clone()).await?;

        let session = DownloadSession::new(id.clone(), self.config.progress_capacity);
        let subscription = session.subscribe();
        self.sessions.lock().insert(id.clone(), session.clone());

        info!(id = %id, source = source_url, "Starting download");
        let this = self.clone();
        self.tasks.spawn(async move { this.run_download(entry, session).await });

        Ok(DownloadTicket::InFlight(subscription))
    }

    /// Cached entry merged with live progress, if the id is known.
    pub fn status(&self, id: &VideoId) -> Option<VideoStatusReport> {
        let entry = self.index.lookup(id)?;
        let percent = match entry.status {
            VideoStatus::Ready => Some(100.0),
            _ => self.sessions.lock().get(id).and_then(|s| s.percent()),
        };
        Some(VideoStatusReport {
            id: entry.id,
            status: entry.status,
            percent,
            file_path: entry.file_path,
            size_bytes: entry.size_bytes,
            last_error: entry.last_error,
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Kill running downloads and wait for them to record their failure.
    pub async fn shutdown(&self) {
        let running = self.active_sessions();
        if running > 0 {
            info!(running, "Cancelling in-flight downloads");
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        if let Err(e) = self.index.flush().await {
            warn!(error = %e, "Failed to save access times");
        }
    }

    async fn run_download(self: Arc<Self>, entry: VideoEntry, session: Arc<DownloadSession>) {
        let id = entry.id.clone();
        let staging = self.index.storage_dir().join(STAGING_DIR).join(id.as_str());

        let outcome = self.fetch_into_place(&entry, &session, &staging).await;
        // partial files go before the entry is marked failed
        remove_staging(&staging).await;

        let guard = self.index.lock(&id).await;
        let terminal = match outcome {
            Ok((file_path, size_bytes)) => {
                info!(id = %id, bytes = size_bytes, path = ?file_path, "Download complete");
                if let Err(e) = self
                    .index
                    .upsert(entry.into_ready(file_path.clone(), size_bytes))
                    .await
                {
                    error!(id = %id, error = %e, "Failed to persist completed entry");
                }
                TerminalEvent::Ready {
                    id: id.clone(),
                    file_path,
                    size_bytes,
                }
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Download failed");
                let message = e.to_string();
                if let Err(persist) = self.index.upsert(entry.into_failed(message.clone())).await {
                    error!(id = %id, error = %persist, "Failed to persist failed entry");
                }
                TerminalEvent::Failed {
                    id: id.clone(),
                    kind: e.kind(),
                    message,
                }
            }
        };

        let succeeded = terminal.is_ready();
        session.finish(terminal);
        {
            let mut sessions = self.sessions.lock();
            if sessions.get(&id).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                sessions.remove(&id);
            }
        }
        drop(guard);

        if succeeded {
            self.eviction.trigger().kick();
        }
    }

    /// Download into staging and move the result into the cache. A full
    /// disk gets one eviction pass and one more attempt.
    async fn fetch_into_place(
        &self,
        entry: &VideoEntry,
        session: &Arc<DownloadSession>,
        staging: &Path,
    ) -> Result<(PathBuf, u64)> {
        let progress_session = session.clone();
        let on_progress: OnProgress = Arc::new(move |update| {
            progress_session.publish_progress(update);
        });

        let reason = match self.place_once(entry, on_progress.clone(), staging).await {
            Err(e) if e.kind() == ErrorKind::StorageFull => e,
            other => return other,
        };
        remove_staging(staging).await;
        if self.cancel.is_cancelled() {
            return Err(reason);
        }

        warn!(id = %entry.id, error = %reason, "Storage full, evicting before retry");
        let freed = match self.eviction.run_pass().await {
            Ok(report) => report.freed_bytes,
            Err(e) => {
                error!(id = %entry.id, error = %e, "Eviction pass failed");
                0
            }
        };
        if freed == 0 {
            let detail = match reason {
                EngineError::StorageFull(message) => message,
                other => other.to_string(),
            };
            return Err(EngineError::StorageFull(format!(
                "{detail} (eviction freed no space)"
            )));
        }

        info!(id = %entry.id, freed, "Retrying download after eviction");
        self.place_once(entry, on_progress, staging).await
    }

    async fn place_once(
        &self,
        entry: &VideoEntry,
        on_progress: OnProgress,
        staging: &Path,
    ) -> Result<(PathBuf, u64)> {
        let produced = self.fetch_with_cookies(entry, on_progress, staging).await?;
        let ext = produced
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("webm")
            .to_ascii_lowercase();
        let target = media_path(self.index.storage_dir(), &entry.id, &ext);

        fs::rename(&produced, &target).await?;
        let size_bytes = fs::metadata(&target).await?.len();
        Ok((target, size_bytes))
    }

    /// Fetch without cookies, then with each available cookie source when
    /// the video turns out to be age-restricted.
    async fn fetch_with_cookies(
        &self,
        entry: &VideoEntry,
        on_progress: OnProgress,
        staging: &Path,
    ) -> Result<PathBuf> {
        let mut request = FetchRequest {
            id: entry.id.clone(),
            url: entry.source_url.clone(),
            output_dir: staging.to_path_buf(),
            cookies: None,
        };

        let restricted = match self.fetch_bounded(&request, on_progress.clone()).await {
            Err(EngineError::DownloadFailed(message)) if is_age_restriction_error(&message) => {
                message
            }
            other => return other,
        };

        let attempts = self.cookie_attempts().await;
        if attempts.is_empty() {
            warn!(id = %entry.id, "Age-restricted video and no cookies available");
            return Err(EngineError::DownloadFailed(restricted));
        }

        for cookies in attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(id = %entry.id, using = %cookies, "Age-restricted video, retrying with cookies");
            remove_staging(staging).await;
            request.cookies = Some(cookies.clone());

            match self.fetch_bounded(&request, on_progress.clone()).await {
                Ok(path) => return Ok(path),
                Err(EngineError::DownloadFailed(message)) if is_browser_cookie_error(&message) => {
                    warn!(id = %entry.id, using = %cookies, "Cookie store unreadable, trying next source");
                }
                Err(EngineError::DownloadFailed(message)) => {
                    warn!(id = %entry.id, using = %cookies, error = %message, "Retry with cookies failed");
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::DownloadFailed(format!(
            "age-restricted video could not be downloaded with the available cookies, \
             configure a valid cookies file: {restricted}"
        )))
    }

    /// The cookies file (read again on every call) followed by the configured browsers.
    async fn cookie_attempts(&self) -> Vec<Cookies> {
        let mut attempts = Vec::new();
        if let Some(path) = self.cookies.cookies_file().await {
            if fs::try_exists(&path).await.unwrap_or(false) {
                attempts.push(Cookies::File(path));
            } else {
                warn!(path = ?path, "Cookies file not found, skipping");
            }
        }
        attempts.extend(self.config.cookie_browsers.iter().cloned().map(Cookies::Browser));
        attempts
    }

    async fn fetch_bounded(&self, request: &FetchRequest, on_progress: OnProgress) -> Result<PathBuf> {
        let timeout = self.config.fetch_timeout;
        let fetch = self.tool.fetch(request, on_progress, self.cancel.child_token());
        if timeout.is_zero() {
            return fetch.await;
        }
        match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DownloadFailed(format!(
                "fetch tool timed out after {timeout:?}"
            ))),
        }
    }
}

async fn remove_staging(staging: &Path) {
    match fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?staging, error = %e, "Failed to remove staging directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::broadcast::{ProgressEvent, ProgressUpdate};
    use crate::eviction::StaticLimit;
    use crate::fetch::StaticCookies;
    use chrono::{Duration as ChronoDuration, Utc};

    #[derive(Debug, Clone)]
    enum Script {
        Succeed { steps: Vec<f32>, bytes: &'static [u8] },
        Fail(&'static str),
        DiskFull,
        Hang,
    }

    /// Fetch tool fake that replays scripted outcomes and counts invocations
    struct ScriptedTool {
        scripts: parking_lot::Mutex<VecDeque<Script>>,
        calls: AtomicUsize,
        requests: parking_lot::Mutex<Vec<FetchRequest>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedTool {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: parking_lot::Mutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
                requests: parking_lot::Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated(scripts: Vec<Script>, gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(scripts)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FetchTool for ScriptedTool {
        async fn version(&self) -> Result<String> {
            Ok("scripted".into())
        }

        async fn fetch(
            &self,
            request: &FetchRequest,
            on_progress: OnProgress,
            cancel: CancellationToken,
        ) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            let script = {
                let mut scripts = self.scripts.lock();
                if scripts.len() > 1 {
                    scripts.pop_front()
                } else {
                    scripts.front().cloned()
                }
            }
            .expect("no script");

            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }

            std::fs::create_dir_all(&request.output_dir).unwrap();
            let out = request.output_dir.join(format!("{}.webm", request.id));
            match script {
                Script::Succeed { steps, bytes } => {
                    for step in steps {
                        on_progress(ProgressUpdate::at(step));
                        tokio::task::yield_now().await;
                    }
                    std::fs::write(&out, bytes).unwrap();
                    Ok(out)
                }
                Script::Fail(message) => {
                    std::fs::write(&out, b"partial").unwrap();
                    Err(EngineError::DownloadFailed(message.into()))
                }
                Script::DiskFull => {
                    std::fs::write(&out, b"partial").unwrap();
                    Err(EngineError::StorageFull("No space left on device".into()))
                }
                Script::Hang => {
                    std::fs::write(&out, b"partial").unwrap();
                    cancel.cancelled().await;
                    Err(EngineError::DownloadFailed("download cancelled by shutdown".into()))
                }
            }
        }
    }

    fn succeed() -> Script {
        Script::Succeed {
            steps: vec![10.0, 50.0, 90.0],
            bytes: b"video-bytes",
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        index: Arc<CacheIndex>,
        tool: Arc<ScriptedTool>,
        orchestrator: Arc<DownloadOrchestrator>,
    }

    /// Cookies file that can be swapped while the orchestrator runs
    #[derive(Default)]
    struct SwappableCookies(parking_lot::Mutex<Option<PathBuf>>);

    #[async_trait]
    impl CookiesSource for SwappableCookies {
        async fn cookies_file(&self) -> Option<PathBuf> {
            self.0.lock().clone()
        }
    }

    async fn fixture(tool: ScriptedTool, configure: impl FnOnce(EngineConfig) -> EngineConfig) -> Fixture {
        fixture_with(tool, 0, Arc::new(StaticCookies::default()), configure).await
    }

    async fn fixture_with(
        tool: ScriptedTool,
        limit: u64,
        cookies: Arc<dyn CookiesSource>,
        configure: impl FnOnce(EngineConfig) -> EngineConfig,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        let tool = Arc::new(tool);
        let config = configure(EngineConfig::builder().with_storage_dir(dir.path()).build());
        let eviction = Arc::new(EvictionManager::new(index.clone(), Arc::new(StaticLimit(limit))));
        let orchestrator = DownloadOrchestrator::new(index.clone(), tool.clone(), config, eviction, cookies);
        Fixture {
            _dir: dir,
            index,
            tool,
            orchestrator,
        }
    }

    fn expect_in_flight(ticket: DownloadTicket) -> Subscription {
        match ticket {
            DownloadTicket::InFlight(sub) => sub,
            DownloadTicket::Cached(entry) => panic!("unexpected cache hit: {entry:?}"),
        }
    }

    fn id() -> VideoId {
        VideoId::parse("abc123").unwrap()
    }

    async fn put_ready(index: &CacheIndex, raw: &str, size: usize, age_secs: i64) {
        let id = VideoId::parse(raw).unwrap();
        let path = media_path(index.storage_dir(), &id, "webm");
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let mut entry = VideoEntry::pending(id, format!("https://youtu.be/{raw}"))
            .into_downloading()
            .into_ready(path, size as u64);
        entry.last_accessed_at = Utc::now() - ChronoDuration::seconds(age_secs);
        index.upsert(entry).await.unwrap();
    }

    fn write_cookies(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, "# Netscape HTTP Cookie File\n").unwrap();
        path
    }

    const URL: &str = "https://www.youtube.com/watch?v=abc123";

    #[tokio::test]
    async fn test_concurrent_requests_share_one_download() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(ScriptedTool::gated(vec![succeed()], gate.clone()), |c| c).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let orchestrator = f.orchestrator.clone();
            // mix of url spellings for the same video
            let url = if i % 2 == 0 { URL } else { "https://youtu.be/abc123?si=share" };
            handles.push(tokio::spawn(async move {
                expect_in_flight(orchestrator.request_download(url).await.unwrap())
            }));
        }
        let mut subs = Vec::new();
        for handle in handles {
            subs.push(handle.await.unwrap());
        }
        assert_eq!(f.orchestrator.active_sessions(), 1);

        gate.add_permits(1);
        for sub in subs {
            match sub.wait_terminal().await {
                Some(TerminalEvent::Ready { size_bytes, .. }) => assert_eq!(size_bytes, 11),
                other => panic!("unexpected terminal: {other:?}"),
            }
        }
        assert_eq!(f.tool.calls(), 1);
        assert_eq!(f.orchestrator.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_is_idempotent() {
        let f = fixture(ScriptedTool::new(vec![succeed()]), |c| c).await;
        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        sub.wait_terminal().await.unwrap();

        let first = match f.orchestrator.request_download(URL).await.unwrap() {
            DownloadTicket::Cached(entry) => entry,
            other => panic!("expected hit, got {other:?}"),
        };
        let second = match f.orchestrator.request_download("abc123").await.unwrap() {
            DownloadTicket::Cached(entry) => entry,
            other => panic!("expected hit, got {other:?}"),
        };

        assert_eq!(f.tool.calls(), 1);
        assert_eq!(first.file_path, second.file_path);
        assert_eq!(
            first.file_path,
            Some(media_path(f.index.storage_dir(), &id(), "webm"))
        );
        assert!(second.last_accessed_at >= first.last_accessed_at);
    }

    #[tokio::test]
    async fn test_progress_is_relayed_in_order() {
        let f = fixture(ScriptedTool::new(vec![succeed()]), |c| c).await;
        let mut sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());

        let mut percents = Vec::new();
        let mut terminal = None;
        while let Some(event) = sub.recv().await {
            match event {
                ProgressEvent::Progress(update) => percents.push(update.percent),
                ProgressEvent::Terminal(t) => terminal = Some(t),
            }
        }
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert!(matches!(terminal, Some(TerminalEvent::Ready { .. })));

        let status = f.orchestrator.status(&id()).unwrap();
        assert_eq!(status.status, VideoStatus::Ready);
        assert_eq!(status.percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_only_terminal() {
        let f = fixture(ScriptedTool::new(vec![succeed()]), |c| c).await;
        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        let session = sub.session().clone();
        sub.wait_terminal().await.unwrap();

        let mut late = session.subscribe();
        match late.recv().await {
            Some(ProgressEvent::Terminal(TerminalEvent::Ready { id: got, .. })) => assert_eq!(got, id()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_then_retry_starts_fresh() {
        let tool = ScriptedTool::new(vec![Script::Fail("ERROR: Video unavailable"), succeed()]);
        let f = fixture(tool, |c| c).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        let first_session = sub.session().clone();
        match sub.wait_terminal().await {
            Some(TerminalEvent::Failed { kind, message, .. }) => {
                assert_eq!(kind, ErrorKind::DownloadFailed);
                assert!(message.contains("Video unavailable"));
            }
            other => panic!("unexpected terminal: {other:?}"),
        }

        let entry = f.index.lookup(&id()).unwrap();
        assert_eq!(entry.status, VideoStatus::Failed);
        assert!(entry.file_path.is_none());
        assert!(!f.index.storage_dir().join(STAGING_DIR).join("abc123").exists());
        assert!(!media_path(f.index.storage_dir(), &id(), "webm").exists());
        assert_eq!(f.orchestrator.active_sessions(), 0);

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(!Arc::ptr_eq(sub.session(), &first_session));
        assert!(sub.wait_terminal().await.unwrap().is_ready());
        assert_eq!(f.tool.calls(), 2);
        assert_eq!(f.index.lookup(&id()).unwrap().status, VideoStatus::Ready);
    }

    #[tokio::test]
    async fn test_cache_hit_with_missing_file_downloads_again() {
        let f = fixture(ScriptedTool::new(vec![succeed()]), |c| c).await;
        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        sub.wait_terminal().await.unwrap();

        let path = media_path(f.index.storage_dir(), &id(), "webm");
        std::fs::remove_file(&path).unwrap();

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(sub.wait_terminal().await.unwrap().is_ready());
        assert_eq!(f.tool.calls(), 2);
        assert!(path.exists());
        assert_eq!(f.index.total_size_bytes(), 11);
    }

    #[tokio::test]
    async fn test_age_restricted_retries_with_cookies() {
        let cookies_dir = tempfile::tempdir().unwrap();
        let cookies = write_cookies(&cookies_dir);
        let tool = ScriptedTool::new(vec![
            Script::Fail("ERROR: [youtube] abc123: Sign in to confirm your age"),
            succeed(),
        ]);
        let f = fixture_with(tool, 0, Arc::new(StaticCookies(Some(cookies.clone()))), |c| c).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(sub.wait_terminal().await.unwrap().is_ready());

        let requests = f.tool.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].cookies.is_none());
        assert_eq!(requests[1].cookies, Some(Cookies::File(cookies)));
    }

    #[tokio::test]
    async fn test_age_restricted_falls_back_to_browsers() {
        let cookies_dir = tempfile::tempdir().unwrap();
        let cookies = write_cookies(&cookies_dir);
        let tool = ScriptedTool::new(vec![
            Script::Fail("ERROR: Sign in to confirm your age"),
            Script::Fail("ERROR: Sign in to confirm your age"),
            Script::Fail("ERROR: Failed to decrypt with DPAPI"),
            succeed(),
        ]);
        let f = fixture_with(tool, 0, Arc::new(StaticCookies(Some(cookies.clone()))), |mut c| {
            c.cookie_browsers = vec!["chrome".into(), "firefox".into()];
            c
        })
        .await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(sub.wait_terminal().await.unwrap().is_ready());

        let used: Vec<Option<Cookies>> =
            f.tool.requests.lock().iter().map(|r| r.cookies.clone()).collect();
        assert_eq!(
            used,
            vec![
                None,
                Some(Cookies::File(cookies)),
                Some(Cookies::Browser("chrome".into())),
                Some(Cookies::Browser("firefox".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_age_restricted_all_cookies_fail() {
        let tool = ScriptedTool::new(vec![Script::Fail("ERROR: Sign in to confirm your age")]);
        let f = fixture(tool, |mut c| {
            c.cookie_browsers = vec!["firefox".into()];
            c
        })
        .await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        match sub.wait_terminal().await {
            Some(TerminalEvent::Failed { kind, message, .. }) => {
                assert_eq!(kind, ErrorKind::DownloadFailed);
                assert!(message.contains("age-restricted"));
            }
            other => panic!("unexpected terminal: {other:?}"),
        }
        assert_eq!(f.tool.calls(), 2);
    }

    #[tokio::test]
    async fn test_cookies_file_is_read_on_each_retry() {
        let source = Arc::new(SwappableCookies::default());
        let tool = ScriptedTool::new(vec![
            Script::Fail("ERROR: Sign in to confirm your age"),
            Script::Fail("ERROR: Sign in to confirm your age"),
            succeed(),
        ]);
        let f = fixture_with(tool, 0, source.clone(), |c| c).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(!sub.wait_terminal().await.unwrap().is_ready());
        assert_eq!(f.tool.calls(), 1);

        // cookies configured while the server keeps running
        let cookies_dir = tempfile::tempdir().unwrap();
        let cookies = write_cookies(&cookies_dir);
        *source.0.lock() = Some(cookies.clone());

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(sub.wait_terminal().await.unwrap().is_ready());
        let requests = f.tool.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].cookies, Some(Cookies::File(cookies)));
    }

    #[tokio::test]
    async fn test_age_restricted_without_cookies_fails() {
        // a configured file that does not exist is skipped
        let missing = PathBuf::from("/nonexistent/vidcache/cookies.txt");
        let tool = ScriptedTool::new(vec![Script::Fail("ERROR: Sign in to confirm your age")]);
        let f = fixture_with(tool, 0, Arc::new(StaticCookies(Some(missing))), |c| c).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        assert!(!sub.wait_terminal().await.unwrap().is_ready());
        assert_eq!(f.tool.calls(), 1);
    }

    #[tokio::test]
    async fn test_storage_full_evicts_then_retries() {
        let tool = ScriptedTool::new(vec![Script::DiskFull, succeed()]);
        let f = fixture_with(tool, 150, Arc::new(StaticCookies::default()), |c| c).await;
        put_ready(&f.index, "old1", 100, 60).await;
        put_ready(&f.index, "old2", 100, 30).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        match sub.wait_terminal().await {
            Some(TerminalEvent::Ready { size_bytes, .. }) => assert_eq!(size_bytes, 11),
            other => panic!("unexpected terminal: {other:?}"),
        }
        assert_eq!(f.tool.calls(), 2);
        assert!(f.index.lookup(&VideoId::parse("old1").unwrap()).is_none());
        assert!(f.index.lookup(&VideoId::parse("old2").unwrap()).is_some());
        assert!(!f.index.storage_dir().join(STAGING_DIR).join("abc123").exists());
    }

    #[tokio::test]
    async fn test_storage_full_with_nothing_to_evict_fails() {
        let f = fixture(ScriptedTool::new(vec![Script::DiskFull]), |c| c).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        match sub.wait_terminal().await {
            Some(TerminalEvent::Failed { kind, message, .. }) => {
                assert_eq!(kind, ErrorKind::StorageFull);
                assert!(message.contains("eviction freed no space"));
            }
            other => panic!("unexpected terminal: {other:?}"),
        }
        assert_eq!(f.tool.calls(), 1);
        assert_eq!(f.index.lookup(&id()).unwrap().status, VideoStatus::Failed);
        assert!(!f.index.storage_dir().join(STAGING_DIR).join("abc123").exists());
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let f = fixture(ScriptedTool::new(vec![Script::Hang]), |mut c| {
            c.fetch_timeout = Duration::from_millis(50);
            c
        })
        .await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        match sub.wait_terminal().await {
            Some(TerminalEvent::Failed { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("unexpected terminal: {other:?}"),
        }
        assert!(!f.index.storage_dir().join(STAGING_DIR).join("abc123").exists());
        assert_eq!(f.index.lookup(&id()).unwrap().status, VideoStatus::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_downloads() {
        let f = fixture(ScriptedTool::new(vec![Script::Hang]), |c| c).await;
        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.orchestrator.shutdown().await;

        match sub.wait_terminal().await {
            Some(TerminalEvent::Failed { message, .. }) => assert!(message.contains("shutdown")),
            other => panic!("unexpected terminal: {other:?}"),
        }
        assert_eq!(f.orchestrator.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_invalid_source_is_rejected() {
        let f = fixture(ScriptedTool::new(vec![succeed()]), |c| c).await;
        let err = f
            .orchestrator
            .request_download("https://vimeo.com/12345")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSource(_)));
        assert_eq!(f.tool.calls(), 0);
        assert!(f.index.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_cancel() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(ScriptedTool::gated(vec![succeed()], gate.clone()), |c| c).await;

        let sub = expect_in_flight(f.orchestrator.request_download(URL).await.unwrap());
        drop(sub);
        gate.add_permits(1);

        let mut waited = 0;
        while f.orchestrator.active_sessions() > 0 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(f.index.lookup(&id()).unwrap().status, VideoStatus::Ready);
    }

    /// State letter from `/proc/<pid>/stat`, `None` once the process is gone
    #[cfg(target_os = "linux")]
    fn process_state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let (_, rest) = stat.rsplit_once(") ")?;
        rest.chars().next()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_tool_process() {
        use std::os::unix::fs::PermissionsExt;

        use crate::fetch::YtDlp;

        let scripts = tempfile::tempdir().unwrap();
        let pid_file = scripts.path().join("tool.pid");
        let tool_path = scripts.path().join("yt-dlp");
        let script = format!(
            r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
dir=$(dirname "$out")
mkdir -p "$dir"
printf partial > "$dir/abc123.webm.part"
echo $$ > "{}"
exec sleep 30
"#,
            pid_file.display()
        );
        std::fs::write(&tool_path, script).unwrap();
        std::fs::set_permissions(&tool_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        let config = EngineConfig::builder()
            .with_storage_dir(dir.path())
            .with_tool_path(&tool_path)
            .with_fetch_timeout(Duration::from_millis(500))
            .build();
        let tool = Arc::new(YtDlp::from_config(&config));
        let eviction = Arc::new(EvictionManager::new(index.clone(), Arc::new(StaticLimit(0))));
        let orchestrator = DownloadOrchestrator::new(
            index.clone(),
            tool,
            config,
            eviction,
            Arc::new(StaticCookies::default()),
        );

        let sub = expect_in_flight(orchestrator.request_download(URL).await.unwrap());
        match sub.wait_terminal().await {
            Some(TerminalEvent::Failed { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("unexpected terminal: {other:?}"),
        }

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        // a killed child can linger as a zombie until tokio reaps it
        let gone = |state: Option<char>| matches!(state, None | Some('Z') | Some('X'));
        let mut state = process_state(pid);
        for _ in 0..100 {
            if gone(state) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = process_state(pid);
        }
        assert!(gone(state), "tool process {pid} still running in state {state:?}");
        assert!(!dir.path().join(STAGING_DIR).join("abc123").exists());
        assert_eq!(index.lookup(&id()).unwrap().status, VideoStatus::Failed);
    }
}
