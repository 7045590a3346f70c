//! Shard definition rows
//!
//! One row per bucket, one column per shard index. The cell timestamp is the
//! shard's creation time, so a later rewrite of the same index always wins.

use super::types::{DirectedEdgeMeta, Shard};
use crate::graph::Scope;
use crate::persistence::{
    decode_i64, encode_i64, ColumnFamily, ColumnRange, ColumnStore, MutationBatch, StorageResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct StoredShard {
    created_time: i64,
    compacted: bool,
}

#[derive(Clone)]
pub struct EdgeShardSerialization {
    store: Arc<dyn ColumnStore>,
}

impl EdgeShardSerialization {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        EdgeShardSerialization { store }
    }

    pub fn write_shard_meta(
        &self,
        scope: &Scope,
        shard: &Shard,
        meta: &DirectedEdgeMeta,
    ) -> StorageResult<MutationBatch> {
        let value = bincode::serialize(&StoredShard {
            created_time: shard.created_time(),
            compacted: shard.is_compacted(),
        })?;
        let mut batch = MutationBatch::new();
        batch.put(
            ColumnFamily::ShardMeta,
            meta.bucket_key(scope),
            encode_i64(shard.shard_index()).to_vec(),
            value,
            shard.created_time(),
        );
        Ok(batch)
    }

    pub fn remove_shard_meta(
        &self,
        scope: &Scope,
        shard: &Shard,
        meta: &DirectedEdgeMeta,
    ) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.delete(
            ColumnFamily::ShardMeta,
            meta.bucket_key(scope),
            encode_i64(shard.shard_index()).to_vec(),
            shard.created_time(),
        );
        batch
    }

    /// Every shard of the bucket, newest first
    pub async fn get_shard_meta_data(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
    ) -> StorageResult<Vec<Shard>> {
        let columns = self
            .store
            .scan(
                ColumnFamily::ShardMeta,
                &meta.bucket_key(scope),
                &ColumnRange::all().reversed(),
            )
            .await?;

        columns
            .into_iter()
            .map(|column| -> StorageResult<Shard> {
                let stored: StoredShard = bincode::deserialize(&column.value)?;
                Ok(Shard::new(
                    decode_i64(&column.name)?,
                    stored.created_time,
                    stored.compacted,
                ))
            })
            .collect()
    }
}
