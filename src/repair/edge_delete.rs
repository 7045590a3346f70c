//! Metadata cleanup after an edge is tombstoned
//!
//! Each of the four registry facets the edge contributed to is probed for
//! another live edge. A facet nobody else uses is removed; the probes run
//! concurrently and their removals commit as one batch.
//!
//! Registrations carry the newest edge timestamp ever written under them,
//! which may be above the tombstone. Each facet's registration is read before
//! its probe and removed at the later of the two timestamps.

use super::count_live_edges;
use crate::graph::{EdgeSearch, GraphResult, MarkedEdge, Scope};
use crate::persistence::{ColumnStore, MutationBatch};
use crate::serialization::{EdgeMetadataSerialization, EdgeSerialization};
use std::sync::Arc;
use tracing::debug;

/// One live edge is all a probe needs to find
const PROBE_LIMIT: usize = 1;

#[derive(Clone)]
pub struct EdgeDeleteRepair {
    store: Arc<dyn ColumnStore>,
    edges: Arc<dyn EdgeSerialization>,
    metadata: EdgeMetadataSerialization,
}

impl EdgeDeleteRepair {
    pub fn new(
        store: Arc<dyn ColumnStore>,
        edges: Arc<dyn EdgeSerialization>,
        metadata: EdgeMetadataSerialization,
    ) -> Self {
        EdgeDeleteRepair {
            store,
            edges,
            metadata,
        }
    }

    /// Live edges of `search` at any timestamp. The tombstone hides the
    /// deleted edge itself.
    async fn others(&self, scope: &Scope, search: EdgeSearch) -> GraphResult<usize> {
        count_live_edges(self.edges.as_ref(), scope, &search, PROBE_LIMIT).await
    }

    /// Remove the registry entries only `edge` was keeping alive.
    ///
    /// Returns how many entries were removed.
    pub async fn repair(&self, scope: &Scope, edge: &MarkedEdge) -> GraphResult<usize> {
        let source = edge.source.clone();
        let target = edge.target.clone();
        let edge_type = edge.edge_type.as_str();
        let target_type = target.id_type();
        let source_type = source.id_type();

        let (target_type_at, source_type_at, from_source_at, to_target_at) = tokio::try_join!(
            self.metadata
                .id_type_from_source_at(scope, &source, edge_type, target_type),
            self.metadata
                .id_type_to_target_at(scope, &target, edge_type, source_type),
            self.metadata.edge_type_from_source_at(scope, &source, edge_type),
            self.metadata.edge_type_to_target_at(scope, &target, edge_type),
        )?;

        let (by_target_type, by_source_type, from_source, to_target) = tokio::try_join!(
            self.others(
                scope,
                EdgeSearch::from_source_by_target_type(source.clone(), edge_type, target_type),
            ),
            self.others(
                scope,
                EdgeSearch::to_target_by_source_type(target.clone(), edge_type, source_type),
            ),
            self.others(scope, EdgeSearch::from_source(source.clone(), edge_type)),
            self.others(scope, EdgeSearch::to_target(target.clone(), edge_type)),
        )?;

        let removal_at = |registered: i64| registered.max(edge.timestamp);
        let mut batch = MutationBatch::new();
        if let (0, Some(at)) = (by_target_type, target_type_at) {
            batch.merge(self.metadata.remove_id_type_from_source(
                scope,
                &source,
                edge_type,
                target_type,
                removal_at(at),
            ));
        }
        if let (0, Some(at)) = (by_source_type, source_type_at) {
            batch.merge(self.metadata.remove_id_type_to_target(
                scope,
                &target,
                edge_type,
                source_type,
                removal_at(at),
            ));
        }
        if let (0, Some(at)) = (from_source, from_source_at) {
            batch.merge(self.metadata.remove_edge_type_from_source(
                scope,
                &source,
                edge_type,
                removal_at(at),
            ));
        }
        if let (0, Some(at)) = (to_target, to_target_at) {
            batch.merge(self.metadata.remove_edge_type_to_target(
                scope,
                &target,
                edge_type,
                removal_at(at),
            ));
        }

        let removed = batch.len();
        self.store.execute(batch).await?;
        debug!("Edge delete repair of {} removed {} registry entries", edge, removed);
        Ok(removed)
    }
}
