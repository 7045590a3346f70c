//! Re-derive a node's type registrations from the edges it still has

use super::count_live_edges;
use crate::graph::{EdgeSearch, GraphResult, Id, Scope, TypeSearch};
use crate::persistence::{ColumnStore, MutationBatch};
use crate::serialization::{EdgeMetadataSerialization, EdgeSerialization};
use crate::shard::Direction;
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct EdgeMetaRepair {
    store: Arc<dyn ColumnStore>,
    edges: Arc<dyn EdgeSerialization>,
    metadata: EdgeMetadataSerialization,
    concurrency: usize,
}

impl EdgeMetaRepair {
    pub fn new(
        store: Arc<dyn ColumnStore>,
        edges: Arc<dyn EdgeSerialization>,
        metadata: EdgeMetadataSerialization,
        concurrency: usize,
    ) -> Self {
        EdgeMetaRepair {
            store,
            edges,
            metadata,
            concurrency: concurrency.max(1),
        }
    }

    /// Repair the registrations of `node` as a source of `edge_type`.
    /// Returns the number of peer id types that still have a live edge.
    ///
    /// Removals are issued no lower than `min_timestamp`, and never below the
    /// registration they remove.
    pub async fn repair_sources(
        &self,
        scope: &Scope,
        node: &Id,
        edge_type: &str,
        min_timestamp: i64,
    ) -> GraphResult<usize> {
        self.repair(scope, node, edge_type, Direction::FromSource, min_timestamp)
            .await
    }

    /// Repair the registrations of `node` as a target of `edge_type`
    pub async fn repair_targets(
        &self,
        scope: &Scope,
        node: &Id,
        edge_type: &str,
        min_timestamp: i64,
    ) -> GraphResult<usize> {
        self.repair(scope, node, edge_type, Direction::ToTarget, min_timestamp)
            .await
    }

    /// Registration timestamp of `id_type` and whether a live edge still uses it
    async fn check_id_type(
        &self,
        scope: &Scope,
        node: &Id,
        edge_type: &str,
        direction: Direction,
        id_type: String,
    ) -> GraphResult<(String, Option<i64>, usize)> {
        let (registered, search) = match direction {
            Direction::FromSource => (
                self.metadata
                    .id_type_from_source_at(scope, node, edge_type, &id_type)
                    .await?,
                EdgeSearch::from_source_by_target_type(node.clone(), edge_type, id_type.as_str()),
            ),
            Direction::ToTarget => (
                self.metadata
                    .id_type_to_target_at(scope, node, edge_type, &id_type)
                    .await?,
                EdgeSearch::to_target_by_source_type(node.clone(), edge_type, id_type.as_str()),
            ),
        };
        let live = count_live_edges(self.edges.as_ref(), scope, &search, 1).await?;
        Ok((id_type, registered, live))
    }

    async fn repair(
        &self,
        scope: &Scope,
        node: &Id,
        edge_type: &str,
        direction: Direction,
        min_timestamp: i64,
    ) -> GraphResult<usize> {
        let edge_type_at = match direction {
            Direction::FromSource => {
                self.metadata
                    .edge_type_from_source_at(scope, node, edge_type)
                    .await?
            }
            Direction::ToTarget => {
                self.metadata
                    .edge_type_to_target_at(scope, node, edge_type)
                    .await?
            }
        };

        let listing = TypeSearch::id_types(node.clone(), edge_type);
        let id_types: Vec<String> = match direction {
            Direction::FromSource => self.metadata.get_id_types_from_source(scope, &listing),
            Direction::ToTarget => self.metadata.get_id_types_to_target(scope, &listing),
        }
        .try_collect()
        .await?;

        let probes: Vec<(String, Option<i64>, usize)> = stream::iter(id_types)
            .map(|id_type| self.check_id_type(scope, node, edge_type, direction, id_type))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut batch = MutationBatch::new();
        let mut live = 0;
        for (id_type, registered, count) in &probes {
            if *count > 0 {
                live += 1;
                continue;
            }
            let Some(at) = registered else { continue };
            let at = (*at).max(min_timestamp);
            batch.merge(match direction {
                Direction::FromSource => {
                    self.metadata
                        .remove_id_type_from_source(scope, node, edge_type, id_type, at)
                }
                Direction::ToTarget => {
                    self.metadata
                        .remove_id_type_to_target(scope, node, edge_type, id_type, at)
                }
            });
        }
        if let (0, Some(at)) = (live, edge_type_at) {
            let at = at.max(min_timestamp);
            batch.merge(match direction {
                Direction::FromSource => {
                    self.metadata
                        .remove_edge_type_from_source(scope, node, edge_type, at)
                }
                Direction::ToTarget => {
                    self.metadata
                        .remove_edge_type_to_target(scope, node, edge_type, at)
                }
            });
        }

        debug!(
            "Meta repair of {} [{}] {:?}: {} live id types, {} removals",
            node,
            edge_type,
            direction,
            live,
            batch.len()
        );
        self.store.execute(batch).await?;
        Ok(live)
    }
}
