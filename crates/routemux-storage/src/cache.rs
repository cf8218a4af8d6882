//! Short-lived router-group read cache.
//!
//! TCP upserts validate their external port against the referenced router
//! group on every call; the cache keeps that lookup off the store's hot
//! path. Entries live for a few seconds at most and saves invalidate
//! eagerly, so a stale range can only be observed within the cache TTL.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use routemux_core::RouterGroup;

pub(crate) const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

pub(crate) struct RouterGroupCache {
    entries: DashMap<String, (RouterGroup, Instant)>,
    ttl: Duration,
}

impl RouterGroupCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub(crate) fn get(&self, guid: &str) -> Option<RouterGroup> {
        let entry = self.entries.get(guid)?;
        let (group, cached_at) = entry.value();
        if cached_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(guid);
            return None;
        }
        Some(group.clone())
    }

    pub(crate) fn insert(&self, group: RouterGroup) {
        self.entries
            .insert(group.guid.clone(), (group, Instant::now()));
    }

    pub(crate) fn invalidate(&self, guid: &str) {
        self.entries.remove(guid);
    }
}

impl Default for RouterGroupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
