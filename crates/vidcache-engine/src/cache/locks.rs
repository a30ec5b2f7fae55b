//! Per-video async locks.
//!
//! Operations on the same video serialize on its lock while different videos
//! proceed in parallel. Idle locks are dropped from the table when their last
//! holder releases them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::source::VideoId;

type LockTable = Mutex<HashMap<VideoId, Arc<AsyncMutex<()>>>>;

#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    table: Arc<LockTable>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &VideoId) -> KeyGuard {
        let mutex = {
            let mut table = self.table.lock();
            table.entry(id.clone()).or_default().clone()
        };
        let guard = mutex.clone().lock_owned().await;
        KeyGuard {
            id: id.clone(),
            mutex,
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Number of ids with a live lock, held or awaited.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one video id, released on drop
pub struct KeyGuard {
    id: VideoId,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl KeyGuard {
    pub fn id(&self) -> &VideoId {
        &self.id
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        // table + this guard's handle + the owned guard's handle
        if Arc::strong_count(&self.mutex) <= 3 {
            table.remove(&self.id);
        }
        self.guard.take();
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("id", &self.id).finish()
    }
}
