//! Shard allocation for a bucket
//!
//! New shards are never created at "now". They are placed
//! `shard_lookahead_ms` in the future so that every process, even one whose
//! shard cache is as stale as the TTL allows, routes writes to the new shard
//! before anybody could still be choosing the old one. That lookahead is what
//! lets concurrent, uncoordinated audits allocate without locking.

use super::counter::NodeShardApproximation;
use super::group::ShardEntryGroup;
use super::serialization::EdgeShardSerialization;
use super::types::{DirectedEdgeMeta, Shard};
use crate::graph::{GraphConfig, GraphResult, Scope, TimeService};
use crate::persistence::{ColumnStore, MutationBatch};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct NodeShardAllocation {
    shards: EdgeShardSerialization,
    counter: NodeShardApproximation,
    store: Arc<dyn ColumnStore>,
    time: Arc<dyn TimeService>,
    config: Arc<GraphConfig>,
}

impl NodeShardAllocation {
    pub fn new(
        shards: EdgeShardSerialization,
        counter: NodeShardApproximation,
        store: Arc<dyn ColumnStore>,
        time: Arc<dyn TimeService>,
        config: Arc<GraphConfig>,
    ) -> Self {
        NodeShardAllocation {
            shards,
            counter,
            store,
            time,
            config,
        }
    }

    /// Every shard group of the bucket, oldest first.
    ///
    /// The first read of a bucket persists its root shard. Racing audits may
    /// leave several shards further in the future than the cache TTL; only the
    /// nearest of those is kept and the rest are removed.
    pub async fn get_shards(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
    ) -> GraphResult<Vec<ShardEntryGroup>> {
        let mut shards = self.shards.get_shard_meta_data(scope, meta).await?;

        if shards.is_empty() {
            let root = Shard::root();
            self.store
                .execute(self.shards.write_shard_meta(scope, &root, meta)?)
                .await?;
            debug!("Created root shard for {}", meta);
            shards.push(root);
        }

        let horizon = self
            .time
            .current_time()
            .saturating_add(self.config.shard_cache_timeout_ms);
        // Newest first, so the future shards form a prefix and the last of
        // them is the nearest one.
        let future = shards.iter().take_while(|s| s.shard_index() > horizon).count();
        if future > 1 {
            let mut removals = MutationBatch::new();
            for shard in shards.drain(..future - 1) {
                debug!("Pruning duplicate future {} of {}", shard, meta);
                removals.merge(self.shards.remove_shard_meta(scope, &shard, meta));
            }
            self.store.execute(removals).await?;
        }

        let bucket = meta.to_string();
        let mut groups = Vec::new();
        let mut current = ShardEntryGroup::for_bucket(bucket.clone(), self.config.shard_min_delta_ms);
        for shard in shards.into_iter().rev() {
            if !current.add_shard(shard)? {
                groups.push(current);
                current = ShardEntryGroup::for_bucket(bucket.clone(), self.config.shard_min_delta_ms);
                current.add_shard(shard)?;
            }
        }
        groups.push(current);

        Ok(groups)
    }

    /// Allocate a future shard if the newest one has filled up.
    ///
    /// Returns `true` only when a shard was written.
    pub async fn audit_max_shard(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
    ) -> GraphResult<bool> {
        let shards = self.shards.get_shard_meta_data(scope, meta).await?;
        let Some(max) = shards.first() else {
            return Ok(false);
        };

        let now = self.time.current_time();
        if max.shard_index() > now {
            return Ok(false);
        }

        let count = self.counter.get_count(scope, max, meta).await?;
        if count < self.config.shard_size {
            return Ok(false);
        }

        let shard = Shard::new(
            now.saturating_add(self.config.shard_lookahead_ms()),
            now,
            false,
        );
        self.store
            .execute(self.shards.write_shard_meta(scope, &shard, meta)?)
            .await?;
        info!("Allocated {} for {} after {} writes", shard, meta, count);
        Ok(true)
    }
}
