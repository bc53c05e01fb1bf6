use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::signal::ChannelStatus;

#[derive(Default)]
struct CacheInner {
    values: HashMap<u32, ChannelStatus>,
    dirty: HashSet<u32>,
}

/// Change-tracking store for the latest value of every channel.
///
/// One lock guards both the value map and the dirty set so a claim always
/// sees a consistent pair. All returned collections are snapshots; mutating
/// the cache afterwards does not affect a result already handed out.
#[derive(Default)]
pub struct ChannelStateCache {
    inner: Mutex<CacheInner>,
}

impl ChannelStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store incoming statuses, marking a channel dirty only when it is new
    /// or its value actually changed. Timestamp-only refreshes are dropped.
    pub fn update_channel_values(&self, statuses: &[ChannelStatus]) {
        if let Ok(mut inner) = self.inner.lock() {
            for status in statuses {
                let changed = inner
                    .values
                    .get(&status.channel_id)
                    .map(|existing| existing.value != status.value)
                    .unwrap_or(true);
                if changed {
                    inner.values.insert(status.channel_id, status.clone());
                    inner.dirty.insert(status.channel_id);
                }
            }
        }
    }

    /// Current status of every dirty channel; clears the dirty set.
    pub fn claim_dirty_channels(&self) -> Vec<ChannelStatus> {
        match self.inner.lock() {
            Ok(mut inner) => {
                let claimed: Vec<ChannelStatus> = inner
                    .dirty
                    .iter()
                    .filter_map(|id| inner.values.get(id).cloned())
                    .collect();
                inner.dirty.clear();
                claimed
            }
            Err(_) => Vec::new(),
        }
    }

    /// Every stored status regardless of dirty state; clears the dirty set.
    /// Used for a full resync after a consumer (re)connects.
    pub fn claim_all_channels(&self) -> Vec<ChannelStatus> {
        match self.inner.lock() {
            Ok(mut inner) => {
                let all: Vec<ChannelStatus> = inner.values.values().cloned().collect();
                inner.dirty.clear();
                all
            }
            Err(_) => Vec::new(),
        }
    }

    /// Read-only snapshot of all stored values. Does not touch the dirty set.
    pub fn channel_lookup_passive(&self) -> HashMap<u32, ChannelStatus> {
        self.inner
            .lock()
            .map(|inner| inner.values.clone())
            .unwrap_or_default()
    }
}
