//! Node high-water marks
//!
//! Deleting a node records its delete version here. Until the cascade has
//! removed the node's edges, readers hide every edge at or below the mark.

use crate::graph::{Id, Scope};
use crate::persistence::{
    decode_i64, encode_i64, ColumnFamily, ColumnStore, KeyBuilder, MutationBatch, StorageResult,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct NodeSerialization {
    store: Arc<dyn ColumnStore>,
}

fn row_key(scope: &Scope, id: &Id) -> Vec<u8> {
    KeyBuilder::new().scope(scope).id(id).build()
}

impl NodeSerialization {
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        NodeSerialization { store }
    }

    /// Record that `id` was deleted at `timestamp`
    pub fn mark(&self, scope: &Scope, id: &Id, timestamp: i64) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.put(
            ColumnFamily::NodeMarks,
            row_key(scope, id),
            encode_i64(timestamp).to_vec(),
            Vec::new(),
            timestamp,
        );
        batch
    }

    /// Remove marks at or below `timestamp`. A newer delete survives.
    pub fn delete(&self, scope: &Scope, id: &Id, timestamp: i64) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.delete_row(ColumnFamily::NodeMarks, row_key(scope, id), timestamp);
        batch
    }

    pub async fn get_max_version(&self, scope: &Scope, id: &Id) -> StorageResult<Option<i64>> {
        let versions = self.get_max_versions(scope, std::slice::from_ref(id)).await?;
        Ok(versions.get(id).copied())
    }

    /// Highest mark of each id that has one, in a single round trip
    pub async fn get_max_versions(
        &self,
        scope: &Scope,
        ids: &[Id],
    ) -> StorageResult<FxHashMap<Id, i64>> {
        if ids.is_empty() {
            return Ok(FxHashMap::default());
        }
        let rows: Vec<Vec<u8>> = ids.iter().map(|id| row_key(scope, id)).collect();
        let columns = self.store.last_columns(ColumnFamily::NodeMarks, &rows).await?;

        let mut versions = FxHashMap::default();
        for (id, column) in ids.iter().zip(columns) {
            if let Some(column) = column {
                versions.insert(id.clone(), decode_i64(&column.name)?);
            }
        }
        Ok(versions)
    }
}
