//! Bounded, time-expiring cache of shard group lookups
//!
//! Entries are keyed by bucket row key and expire after the configured TTL.
//! A stale entry only ever costs one extra audit; it never changes results,
//! because newly allocated shards sit further in the future than the TTL.

use super::group::ShardEntryGroup;
use crate::graph::TimeService;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

struct CacheEntry {
    groups: Arc<Vec<ShardEntryGroup>>,
    loaded_at: i64,
}

pub struct ShardCache {
    entries: Mutex<LruCache<Vec<u8>, CacheEntry>>,
    ttl: i64,
    time: Arc<dyn TimeService>,
}

impl ShardCache {
    pub fn new(capacity: usize, ttl: i64, time: Arc<dyn TimeService>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ShardCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            time,
        }
    }

    pub async fn get(&self, key: &[u8]) -> Option<Arc<Vec<ShardEntryGroup>>> {
        let now = self.time.current_time();
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if now - entry.loaded_at < self.ttl => return Some(entry.groups.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub async fn put(&self, key: Vec<u8>, groups: Arc<Vec<ShardEntryGroup>>) {
        let loaded_at = self.time.current_time();
        self.entries
            .lock()
            .await
            .put(key, CacheEntry { groups, loaded_at });
    }

    pub async fn invalidate(&self, key: &[u8]) {
        self.entries.lock().await.pop(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
