//! Per-shard write counters
//!
//! Counts only go up: every live edge written to a shard adds one in the same
//! batch as the edge itself, so the count is exact for committed writes.

use super::types::{DirectedEdgeMeta, Shard};
use crate::graph::Scope;
use crate::persistence::{encode_i64, ColumnFamily, ColumnStore, MutationBatch, StorageResult};
use std::sync::Arc;

#[derive(Clone)]
pub struct NodeShardApproximation {
    store: Arc<dyn ColumnStore>,
}

impl NodeShardApproximation {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        NodeShardApproximation { store }
    }

    pub fn increment(
        &self,
        batch: &mut MutationBatch,
        scope: &Scope,
        shard: &Shard,
        meta: &DirectedEdgeMeta,
        count: i64,
    ) {
        batch.increment(
            ColumnFamily::ShardCounts,
            meta.bucket_key(scope),
            encode_i64(shard.shard_index()).to_vec(),
            count,
        );
    }

    pub async fn get_count(
        &self,
        scope: &Scope,
        shard: &Shard,
        meta: &DirectedEdgeMeta,
    ) -> StorageResult<i64> {
        self.store
            .counter(
                ColumnFamily::ShardCounts,
                &meta.bucket_key(scope),
                &encode_i64(shard.shard_index()),
            )
            .await
    }
}
