//! Node delete cascade
//!
//! Starting from the node's highest mark, every edge the node has in either
//! direction at or below the mark is physically removed. The registry is then
//! repaired for both endpoints of each removed edge, and the mark itself goes
//! last. A node without a mark has already been repaired.

use super::edge_delete::EdgeDeleteRepair;
use super::meta::EdgeMetaRepair;
use crate::graph::{EdgeKey, EdgeSearch, GraphConfig, GraphResult, Id, MarkedEdge, Scope, TypeSearch};
use crate::persistence::{ColumnStore, MutationBatch};
use crate::serialization::{EdgeMetadataSerialization, EdgeSerialization, NodeSerialization};
use crate::shard::Direction;
use futures::{stream, StreamExt, TryStreamExt};
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct NodeDeleteRepair {
    store: Arc<dyn ColumnStore>,
    edges: Arc<dyn EdgeSerialization>,
    metadata: EdgeMetadataSerialization,
    nodes: NodeSerialization,
    edge_delete: EdgeDeleteRepair,
    meta: EdgeMetaRepair,
    config: Arc<GraphConfig>,
}

impl NodeDeleteRepair {
    pub fn new(
        store: Arc<dyn ColumnStore>,
        edges: Arc<dyn EdgeSerialization>,
        metadata: EdgeMetadataSerialization,
        nodes: NodeSerialization,
        edge_delete: EdgeDeleteRepair,
        meta: EdgeMetaRepair,
        config: Arc<GraphConfig>,
    ) -> Self {
        NodeDeleteRepair {
            store,
            edges,
            metadata,
            nodes,
            edge_delete,
            meta,
            config,
        }
    }

    /// Newest version of every edge of `node` at or below `max_version`
    async fn newest_edges(
        &self,
        scope: &Scope,
        node: &Id,
        max_version: i64,
    ) -> GraphResult<IndexMap<EdgeKey, MarkedEdge>> {
        let listing = TypeSearch::edge_types(node.clone());
        let outgoing: Vec<String> = self
            .metadata
            .get_edge_types_from_source(scope, &listing)
            .try_collect()
            .await?;
        let incoming: Vec<String> = self
            .metadata
            .get_edge_types_to_target(scope, &listing)
            .try_collect()
            .await?;

        let searches = outgoing
            .into_iter()
            .map(|t| EdgeSearch::from_source(node.clone(), t))
            .chain(incoming.into_iter().map(|t| EdgeSearch::to_target(node.clone(), t)));

        let mut newest = IndexMap::new();
        for search in searches {
            let search = search.max_timestamp(max_version);
            let mut pages = self.edges.get_edges(scope, &search).await?;
            while let Some(page) = pages.next_page().await {
                for edge in page? {
                    // Scans run newest first: the first version seen wins
                    newest.entry(edge.key()).or_insert(edge);
                }
            }
        }
        Ok(newest)
    }

    /// Remove every version of `edge`'s logical edge up to `max_version`,
    /// then clean the registry entries it leaves orphaned
    async fn remove_edge(
        &self,
        scope: &Scope,
        edge: &MarkedEdge,
        max_version: i64,
        timestamp: i64,
    ) -> GraphResult<()> {
        let search = EdgeSearch::versions(
            edge.source.clone(),
            edge.edge_type.clone(),
            edge.target.clone(),
        )
        .max_timestamp(max_version);
        let versions = self.edges.get_edges(scope, &search).await?.collect_all().await?;

        let mut batch = MutationBatch::new();
        for version in &versions {
            batch.merge(self.edges.delete_edge(scope, version, timestamp).await?);
        }
        self.store.execute(batch).await?;

        self.edge_delete.repair(scope, edge).await?;
        Ok(())
    }

    /// Run the cascade for `node`. `timestamp` orders the physical deletes;
    /// edges rewritten after it survive. Returns the number of logical edges
    /// removed.
    pub async fn receive(&self, scope: &Scope, node: &Id, timestamp: i64) -> GraphResult<usize> {
        let Some(max_version) = self.nodes.get_max_version(scope, node).await? else {
            debug!("Node {} has no mark, nothing to cascade", node);
            return Ok(0);
        };

        let newest = self.newest_edges(scope, node, max_version).await?;
        let edges: Vec<MarkedEdge> = newest.into_values().collect();
        let concurrency = self.config.repair_concurrent_size.max(1);

        for chunk in edges.chunks(self.config.repair_buffer_size.max(1)) {
            stream::iter(chunk.to_vec())
                .map(|edge| async move {
                    self.remove_edge(scope, &edge, max_version, timestamp).await
                })
                .buffer_unordered(concurrency)
                .try_collect::<Vec<()>>()
                .await?;
        }

        let endpoints: IndexSet<(Id, String, Direction)> = edges
            .iter()
            .flat_map(|edge| {
                [
                    (edge.source.clone(), edge.edge_type.clone(), Direction::FromSource),
                    (edge.target.clone(), edge.edge_type.clone(), Direction::ToTarget),
                ]
            })
            .collect();
        stream::iter(endpoints)
            .map(|(id, edge_type, direction)| async move {
                match direction {
                    Direction::FromSource => {
                        self.meta.repair_sources(scope, &id, &edge_type, max_version).await
                    }
                    Direction::ToTarget => {
                        self.meta.repair_targets(scope, &id, &edge_type, max_version).await
                    }
                }
            })
            .buffer_unordered(concurrency)
            .try_collect::<Vec<usize>>()
            .await?;

        self.store
            .execute(self.nodes.delete(scope, node, max_version))
            .await?;
        info!(
            "Node {} cascade at version {} removed {} edges",
            node,
            max_version,
            edges.len()
        );
        Ok(edges.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use crate::repair::fixture::Fixture;
    use crate::persistence::ColumnRange;

    fn cascade(f: &Fixture) -> NodeDeleteRepair {
        let edge_delete = EdgeDeleteRepair::new(f.store.clone(), f.edges.clone(), f.metadata.clone());
        let meta = EdgeMetaRepair::new(
            f.store.clone(),
            f.edges.clone(),
            f.metadata.clone(),
            f.config.repair_concurrent_size,
        );
        NodeDeleteRepair::new(
            f.store.clone(),
            f.edges.clone(),
            f.metadata.clone(),
            f.nodes.clone(),
            edge_delete,
            meta,
            f.config.clone(),
        )
    }

    async fn types_from(f: &Fixture, node: &Id) -> Vec<String> {
        f.metadata
            .get_edge_types_from_source(&f.scope, &TypeSearch::edge_types(node.clone()))
            .try_collect()
            .await
            .unwrap()
    }

    async fn types_to(f: &Fixture, node: &Id) -> Vec<String> {
        f.metadata
            .get_edge_types_to_target(&f.scope, &TypeSearch::edge_types(node.clone()))
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unmarked_node_is_a_no_op() {
        let f = Fixture::new();
        let a = Id::generate("user");
        f.write(&Edge::new(a.clone(), "likes", Id::generate("post"), 100)).await;
        assert_eq!(cascade(&f).receive(&f.scope, &a, 20_000).await.unwrap(), 0);
        assert_eq!(types_from(&f, &a).await, vec!["likes"]);
    }

    #[tokio::test]
    async fn test_cascade_removes_edges_and_metadata() {
        let f = Fixture::new();
        let a = Id::generate("user");
        let b = Id::generate("user");
        let c = Id::generate("user");
        let d = Id::generate("user");
        // Several versions of one edge, plus edges in both directions
        f.write(&Edge::new(a.clone(), "follows", b.clone(), 100)).await;
        f.write(&Edge::new(a.clone(), "follows", b.clone(), 150)).await;
        f.write(&Edge::new(a.clone(), "follows", c.clone(), 120)).await;
        f.write(&Edge::new(d.clone(), "follows", a.clone(), 130)).await;
        // b keeps an inbound edge from d
        f.write(&Edge::new(d.clone(), "follows", b.clone(), 140)).await;
        f.store.execute(f.nodes.mark(&f.scope, &a, 200)).await.unwrap();

        assert_eq!(cascade(&f).receive(&f.scope, &a, 20_000).await.unwrap(), 3);

        assert!(types_from(&f, &a).await.is_empty());
        assert!(types_to(&f, &a).await.is_empty());
        assert!(types_to(&f, &c).await.is_empty());
        assert_eq!(types_to(&f, &b).await, vec!["follows"]);
        assert_eq!(types_from(&f, &d).await, vec!["follows"]);

        let remaining = f
            .edges
            .get_edges(&f.scope, &EdgeSearch::from_source(a.clone(), "follows"))
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert!(remaining.is_empty());
        let versions = f
            .store
            .scan(
                crate::persistence::ColumnFamily::EdgeVersions,
                &crate::serialization::versions_row_key(&f.scope, &a, &b, "follows"),
                &ColumnRange::all(),
            )
            .await
            .unwrap();
        assert!(versions.is_empty());
        assert_eq!(f.nodes.get_max_version(&f.scope, &a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_edges_after_mark_survive() {
        let f = Fixture::new();
        let a = Id::generate("user");
        let b = Id::generate("user");
        f.write(&Edge::new(a.clone(), "follows", b.clone(), 100)).await;
        f.write(&Edge::new(a.clone(), "follows", b.clone(), 300)).await;
        f.store.execute(f.nodes.mark(&f.scope, &a, 200)).await.unwrap();

        assert_eq!(cascade(&f).receive(&f.scope, &a, 20_000).await.unwrap(), 1);

        let remaining = f
            .edges
            .get_edges(&f.scope, &EdgeSearch::from_source(a.clone(), "follows"))
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 300);
        assert_eq!(types_from(&f, &a).await, vec!["follows"]);
    }
}
