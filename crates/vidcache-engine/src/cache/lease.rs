//! Reference counts for files currently being served.
//!
//! Eviction skips any id with a live [`ReadLease`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::source::VideoId;

#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    counts: Arc<Mutex<HashMap<VideoId, usize>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, id: &VideoId) -> ReadLease {
        *self.counts.lock().entry(id.clone()).or_insert(0) += 1;
        ReadLease {
            id: id.clone(),
            counts: self.counts.clone(),
        }
    }

    pub fn count(&self, id: &VideoId) -> usize {
        self.counts.lock().get(id).copied().unwrap_or(0)
    }

    pub fn is_leased(&self, id: &VideoId) -> bool {
        self.count(id) > 0
    }
}

/// Keeps a cached file pinned while a response streams it
#[derive(Debug)]
pub struct ReadLease {
    id: VideoId,
    counts: Arc<Mutex<HashMap<VideoId, usize>>>,
}

impl ReadLease {
    pub fn id(&self) -> &VideoId {
        &self.id
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&self.id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.id);
            }
        }
    }
}
