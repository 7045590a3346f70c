//! Resolve the shard groups a read or write should touch

use super::allocation::NodeShardAllocation;
use super::cache::ShardCache;
use super::group::ShardEntryGroup;
use super::types::DirectedEdgeMeta;
use crate::graph::{GraphConfig, GraphResult, Scope, TimeService};
use std::sync::Arc;

#[derive(Clone)]
pub struct NodeShardGroupSearch {
    allocation: NodeShardAllocation,
    cache: Arc<ShardCache>,
}

impl NodeShardGroupSearch {
    pub fn new(
        allocation: NodeShardAllocation,
        config: &GraphConfig,
        time: Arc<dyn TimeService>,
    ) -> Self {
        NodeShardGroupSearch {
            allocation,
            cache: Arc::new(ShardCache::new(
                config.shard_cache_size,
                config.shard_cache_timeout_ms,
                time,
            )),
        }
    }

    async fn groups(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
    ) -> GraphResult<Arc<Vec<ShardEntryGroup>>> {
        let key = meta.bucket_key(scope);
        if let Some(groups) = self.cache.get(&key).await {
            return Ok(groups);
        }
        let groups = Arc::new(self.allocation.get_shards(scope, meta).await?);
        self.cache.put(key, groups.clone()).await;
        Ok(groups)
    }

    /// The group whose range covers `timestamp`
    pub async fn get_write_shard_group(
        &self,
        scope: &Scope,
        timestamp: i64,
        meta: &DirectedEdgeMeta,
    ) -> GraphResult<ShardEntryGroup> {
        let groups = self.groups(scope, meta).await?;
        let covering = groups
            .iter()
            .rev()
            .find(|g| g.min_shard().is_some_and(|s| s.shard_index() <= timestamp))
            .or_else(|| groups.first());
        // get_shards always yields at least one group
        Ok(covering
            .cloned()
            .unwrap_or_else(|| ShardEntryGroup::for_bucket(meta.to_string(), 0)))
    }

    /// Every group that may hold data at or below `timestamp`, newest first
    pub async fn get_read_shard_groups(
        &self,
        scope: &Scope,
        timestamp: i64,
        meta: &DirectedEdgeMeta,
    ) -> GraphResult<Vec<ShardEntryGroup>> {
        let groups = self.groups(scope, meta).await?;
        let readable: Vec<ShardEntryGroup> = groups
            .iter()
            .rev()
            .filter(|g| g.min_shard().is_some_and(|s| s.shard_index() <= timestamp))
            .cloned()
            .collect();
        if readable.is_empty() {
            return Ok(groups.first().cloned().into_iter().collect());
        }
        Ok(readable)
    }

    /// Drop the cached groups of a bucket after its shards changed
    pub async fn invalidate(&self, scope: &Scope, meta: &DirectedEdgeMeta) {
        self.cache.invalidate(&meta.bucket_key(scope)).await;
    }
}
