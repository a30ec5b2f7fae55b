//! # Progress Broadcaster
//!
//! Fan-out of one download's progress to any number of observers.
//!
//! Each session owns a bounded broadcast channel. Publishing never waits for
//! subscribers: a subscriber that falls behind loses its oldest intermediate
//! percentages. The terminal event is the last message ever sent on the
//! channel, so a lagging subscriber always still receives it, and it is
//! cached on the session for subscribers that attach afterwards.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, trace};

use crate::error::ErrorKind;
use crate::source::VideoId;

/// Transfer progress as reported by the fetch tool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Completion percentage, non-decreasing within a session
    pub percent: f32,
    /// Transfer rate as printed by the tool, e.g. `1.23MiB/s`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    /// Remaining time as printed by the tool, e.g. `00:10`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

impl ProgressUpdate {
    /// An update carrying only a percentage
    pub fn at(percent: f32) -> Self {
        Self {
            percent,
            ..Default::default()
        }
    }
}

/// One item in a subscriber's progress stream
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    /// Final event; nothing follows it
    Terminal(TerminalEvent),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Terminal(_))
    }
}

/// Outcome of a download session
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Ready {
        id: VideoId,
        file_path: PathBuf,
        size_bytes: u64,
    },
    Failed {
        id: VideoId,
        kind: ErrorKind,
        message: String,
    },
}

impl TerminalEvent {
    pub fn id(&self) -> &VideoId {
        match self {
            TerminalEvent::Ready { id, .. } | TerminalEvent::Failed { id, .. } => id,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, TerminalEvent::Ready { .. })
    }
}

#[derive(Debug, Default)]
struct SessionState {
    percent: Option<f32>,
    terminal: Option<TerminalEvent>,
    subscribers: usize,
}

/// In-memory state of one in-flight download
#[derive(Debug)]
pub struct DownloadSession {
    id: VideoId,
    tx: broadcast::Sender<ProgressEvent>,
    // guards ordering between publish, finish and subscribe
    state: Mutex<SessionState>,
}

impl DownloadSession {
    pub fn new(id: VideoId, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            id,
            tx,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn id(&self) -> &VideoId {
        &self.id
    }

    /// Forward a progress update to subscribers.
    ///
    /// Updates that would move progress backwards, or arrive after the
    /// terminal event, are dropped. Returns whether the update was sent.
    pub fn publish_progress(&self, mut update: ProgressUpdate) -> bool {
        if !update.percent.is_finite() {
            return false;
        }
        update.percent = update.percent.clamp(0.0, 100.0);
        let percent = update.percent;

        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return false;
        }
        if state.percent.is_some_and(|last| percent <= last) {
            return false;
        }
        state.percent = Some(percent);
        // no receivers is fine, the value is still remembered
        let _ = self.tx.send(ProgressEvent::Progress(update));
        trace!(id = %self.id, percent, "Progress published");
        true
    }

    /// Publish the terminal event. Only the first call has any effect.
    pub fn finish(&self, terminal: TerminalEvent) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return false;
        }
        if terminal.is_ready() {
            state.percent = Some(100.0);
        }
        state.terminal = Some(terminal.clone());
        let delivered = self.tx.send(ProgressEvent::Terminal(terminal)).unwrap_or(0);
        debug!(id = %self.id, subscribers = delivered, "Session finished");
        true
    }

    /// Attach a new observer.
    ///
    /// Before termination the subscription sees every later event; after it,
    /// only the cached terminal event.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let mut state = self.state.lock();
        let inner = match &state.terminal {
            Some(terminal) => Inner::Finished(Some(terminal.clone())),
            None => {
                state.subscribers += 1;
                Inner::Live(BroadcastStream::new(self.tx.subscribe()))
            }
        };
        Subscription {
            session: self.clone(),
            inner,
            done: false,
        }
    }

    pub fn percent(&self) -> Option<f32> {
        self.state.lock().percent
    }

    pub fn terminal(&self) -> Option<TerminalEvent> {
        self.state.lock().terminal.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers
    }

    fn unsubscribe(&self) {
        let mut state = self.state.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        trace!(id = %self.id, remaining = state.subscribers, "Subscriber detached");
    }
}

enum Inner {
    Live(BroadcastStream<ProgressEvent>),
    Finished(Option<TerminalEvent>),
}

/// A subscriber's view of one session.
///
/// Yields progress events in order and ends right after the terminal event.
/// Dropping it detaches the subscriber; the download keeps running.
pub struct Subscription {
    session: Arc<DownloadSession>,
    inner: Inner,
    done: bool,
}

impl Subscription {
    pub fn id(&self) -> &VideoId {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<DownloadSession> {
        &self.session
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        futures::StreamExt::next(self).await
    }

    /// Drain the stream and return its terminal event.
    pub async fn wait_terminal(mut self) -> Option<TerminalEvent> {
        while let Some(event) = self.recv().await {
            if let ProgressEvent::Terminal(terminal) = event {
                return Some(terminal);
            }
        }
        None
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match &mut this.inner {
            Inner::Finished(terminal) => {
                this.done = true;
                Poll::Ready(terminal.take().map(ProgressEvent::Terminal))
            }
            Inner::Live(stream) => loop {
                match Pin::new(&mut *stream).poll_next(cx) {
                    Poll::Ready(Some(Ok(event))) => {
                        if event.is_terminal() {
                            this.done = true;
                        }
                        return Poll::Ready(Some(event));
                    }
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                        debug!(id = %this.session.id, skipped, "Slow subscriber dropped progress updates");
                    }
                    Poll::Ready(None) => {
                        this.done = true;
                        return Poll::Ready(this.session.terminal().map(ProgressEvent::Terminal));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            },
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if matches!(self.inner, Inner::Live(_)) {
            self.session.unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.session.id)
            .field("done", &self.done)
            .finish()
    }
}
