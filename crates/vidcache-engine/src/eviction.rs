//! # Eviction Manager
//!
//! Keeps the bytes held by `Ready` entries at or under the configured limit
//! by removing least recently used videos first.
//!
//! Passes run after every completed download (via [`EvictionTrigger::kick`])
//! and on a fixed interval. The limit is read again on every pass so an
//! operator can change it without a restart. Entries that are being served
//! are never removed; they are reported as deferred and retried on the next
//! pass. An entry whose file cannot be deleted is reported as failed and the
//! pass moves on to the next candidate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheIndex, VideoEntry};
use crate::error::Result;
use crate::source::VideoId;

/// Source of the cache ceiling in bytes. `0` means unlimited.
#[async_trait]
pub trait CacheLimit: Send + Sync {
    async fn max_cache_bytes(&self) -> u64;
}

/// A limit fixed at construction time
#[derive(Debug, Clone, Copy)]
pub struct StaticLimit(pub u64);

#[async_trait]
impl CacheLimit for StaticLimit {
    async fn max_cache_bytes(&self) -> u64 {
        self.0
    }
}

/// Wakes the eviction loop outside its regular interval
#[derive(Debug, Clone, Default)]
pub struct EvictionTrigger(Arc<Notify>);

impl EvictionTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass. Kicks arriving while a pass runs collapse into one.
    pub fn kick(&self) {
        self.0.notify_one();
    }

    async fn notified(&self) {
        self.0.notified().await
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub evicted: Vec<VideoId>,
    pub freed_bytes: u64,
    /// Entries that would have been removed but were being served
    pub deferred: Vec<VideoId>,
    /// Entries whose file could not be deleted
    pub failed: Vec<VideoId>,
    pub total_after: u64,
}

pub struct EvictionManager {
    index: Arc<CacheIndex>,
    limit: Arc<dyn CacheLimit>,
    trigger: EvictionTrigger,
}

impl EvictionManager {
    pub fn new(index: Arc<CacheIndex>, limit: Arc<dyn CacheLimit>) -> Self {
        Self {
            index,
            limit,
            trigger: EvictionTrigger::new(),
        }
    }

    /// Handle for requesting passes, shared with the orchestrator
    pub fn trigger(&self) -> EvictionTrigger {
        self.trigger.clone()
    }

    pub async fn current_limit(&self) -> u64 {
        self.limit.max_cache_bytes().await
    }

    /// Run one pass against the limit currently configured.
    pub async fn run_pass(&self) -> Result<EvictionReport> {
        if let Err(e) = self.index.flush().await {
            warn!(error = %e, "Failed to save access times before eviction");
        }
        let limit = self.current_limit().await;
        self.enforce_limit(limit).await
    }

    /// Evict least recently used `Ready` entries until the total is at most `max_bytes`.
    pub async fn enforce_limit(&self, max_bytes: u64) -> Result<EvictionReport> {
        let mut report = EvictionReport {
            total_after: self.index.total_size_bytes(),
            ..Default::default()
        };
        if max_bytes == 0 || report.total_after <= max_bytes {
            return Ok(report);
        }

        debug!(
            total = report.total_after,
            limit = max_bytes,
            "Cache over limit, evicting"
        );

        for candidate in self.index.list_all() {
            if report.total_after <= max_bytes {
                break;
            }
            if !candidate.is_ready() {
                continue;
            }
            self.try_evict(candidate, &mut report).await;
        }

        if report.total_after > max_bytes {
            warn!(
                total = report.total_after,
                limit = max_bytes,
                deferred = report.deferred.len(),
                failed = report.failed.len(),
                "Cache still over limit after eviction pass"
            );
        }
        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                freed = report.freed_bytes,
                total = report.total_after,
                "Eviction pass complete"
            );
        }
        Ok(report)
    }

    /// Evict every `Ready` entry not currently being served.
    pub async fn clear(&self) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        for candidate in self.index.list_all() {
            if candidate.is_ready() {
                self.try_evict(candidate, &mut report).await;
            }
        }
        report.total_after = self.index.total_size_bytes();
        info!(
            evicted = report.evicted.len(),
            freed = report.freed_bytes,
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "Cache cleared"
        );
        Ok(report)
    }

    async fn try_evict(&self, candidate: VideoEntry, report: &mut EvictionReport) {
        let id = candidate.id.clone();
        if let Err(e) = self.evict_one(candidate, report).await {
            error!(id = %id, error = %e, "Failed to evict entry");
            report.failed.push(id);
        }
    }

    async fn evict_one(&self, candidate: VideoEntry, report: &mut EvictionReport) -> Result<()> {
        let guard = self.index.lock(&candidate.id).await;

        // state may have changed while waiting for the lock
        let Some(current) = self.index.lookup(&candidate.id).filter(|e| e.is_ready()) else {
            return Ok(());
        };
        if self.index.lease_count(&current.id) > 0 {
            warn!(id = %current.id, bytes = current.size_bytes, "Entry is being served, deferring eviction");
            report.deferred.push(current.id);
            return Ok(());
        }

        match self.index.evict_locked(&guard).await? {
            Some(removed) => {
                debug!(id = %removed.id, bytes = removed.size_bytes, "Evicted");
                report.freed_bytes += removed.size_bytes;
                report.total_after = report.total_after.saturating_sub(removed.size_bytes);
                report.evicted.push(removed.id);
            }
            // a lease arrived between the check and the removal
            None => report.deferred.push(current.id),
        }
        Ok(())
    }

    /// Run passes every `interval` and whenever the trigger is kicked, until cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Eviction loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {}
                }

                if let Err(e) = self.run_pass().await {
                    error!(error = %e, "Eviction pass failed");
                }
            }
        })
    }
}
