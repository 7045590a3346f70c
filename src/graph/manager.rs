//! Per-scope entry point for edge writes, deletes and reads
//!
//! Writes and tombstones are durable when the call returns. Everything that
//! follows a delete is handed to the repair pipeline and runs in the
//! background.

use super::edge::{Edge, MarkedEdge};
use super::error::{GraphError, GraphResult};
use super::search::{EdgeSearch, TypeSearch};
use super::time::TimeService;
use super::types::{Id, Scope};
use super::validation::{validate_edge, validate_id, validate_type};
use super::visibility::VisibilityFilter;
use crate::metrics::{ObservabilityContext, OperationTimer};
use crate::persistence::ColumnStore;
use crate::repair::{RepairEvent, RepairOutcome, RepairPipeline};
use crate::serialization::{EdgeMetadataSerialization, EdgeSerialization, NodeSerialization};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

pub type EdgeStream = BoxStream<'static, GraphResult<Edge>>;
pub type TypeStream = BoxStream<'static, GraphResult<String>>;

/// Keep `timer` running until the caller is done with `stream`
fn timed<T: Send + 'static>(
    stream: BoxStream<'static, GraphResult<T>>,
    timer: OperationTimer,
) -> BoxStream<'static, GraphResult<T>> {
    stream
        .map(move |item| {
            let _timer = &timer;
            item
        })
        .boxed()
}

#[derive(Clone)]
pub struct GraphManager {
    scope: Scope,
    store: Arc<dyn ColumnStore>,
    edges: Arc<dyn EdgeSerialization>,
    metadata: EdgeMetadataSerialization,
    nodes: NodeSerialization,
    visibility: VisibilityFilter,
    pipeline: Arc<RepairPipeline>,
    time: Arc<dyn TimeService>,
    metrics: ObservabilityContext,
}

impl GraphManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: Scope,
        store: Arc<dyn ColumnStore>,
        edges: Arc<dyn EdgeSerialization>,
        metadata: EdgeMetadataSerialization,
        nodes: NodeSerialization,
        pipeline: Arc<RepairPipeline>,
        time: Arc<dyn TimeService>,
        metrics: ObservabilityContext,
    ) -> Self {
        let visibility = VisibilityFilter::new(edges.clone(), nodes.clone());
        GraphManager {
            scope,
            store,
            edges,
            metadata,
            nodes,
            visibility,
            pipeline,
            time,
            metrics,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Register the edge's types and write the edge in one batch
    pub async fn write_edge(&self, edge: Edge) -> GraphResult<Edge> {
        let _timer = self.metrics.time("graph.write_edge");
        validate_edge(&edge)?;

        let event_timestamp = self.time.current_time();
        let marked = MarkedEdge::new(edge, false);
        let mut batch = self.metadata.write_edge(&self.scope, &marked);
        batch.merge(
            self.edges
                .write_edge(&self.scope, &marked, event_timestamp)
                .await?,
        );
        self.store.execute(batch).await?;

        debug!("Wrote edge {} in {}", marked, self.scope);
        Ok(marked.into_edge())
    }

    /// Write a tombstone above `edge` and queue its repair.
    ///
    /// The tombstone is durable even when queueing fails.
    pub async fn delete_edge(&self, edge: &Edge) -> GraphResult<MarkedEdge> {
        let _timer = self.metrics.time("graph.delete_edge");
        validate_edge(edge)?;

        let tombstone = MarkedEdge::tombstone_for(edge)?;
        let event_timestamp = self.time.current_time();
        let batch = self
            .edges
            .write_edge(&self.scope, &tombstone, event_timestamp)
            .await?;
        self.store.execute(batch).await?;
        debug!("Wrote tombstone {} in {}", tombstone, self.scope);

        self.pipeline.dispatch(RepairEvent::EdgeDeleted {
            scope: self.scope.clone(),
            edge: tombstone.clone(),
            timestamp: event_timestamp,
        })?;
        Ok(tombstone)
    }

    /// Mark `node` deleted as of now and queue the cascade over its edges.
    /// Returns the mark's version.
    pub async fn delete_node(&self, node: &Id) -> GraphResult<i64> {
        let _timer = self.metrics.time("graph.delete_node");
        validate_id(node, "node")?;

        let version = self.time.current_time();
        self.store
            .execute(self.nodes.mark(&self.scope, node, version))
            .await?;
        debug!("Marked node {} deleted at {} in {}", node, version, self.scope);

        self.pipeline.dispatch(RepairEvent::NodeDeleted {
            scope: self.scope.clone(),
            node: node.clone(),
            timestamp: version,
        })?;
        Ok(version)
    }

    /// Visible edges matching `search`, newest first.
    ///
    /// The read is measured until the returned stream is dropped.
    pub async fn load_edges(&self, search: EdgeSearch) -> GraphResult<EdgeStream> {
        let timer = self.metrics.time("graph.load_edges");
        search.validate()?;
        let edges = self.visibility.load(&self.scope, search).await?;
        Ok(timed(edges, timer))
    }

    pub async fn load_edge_versions(
        &self,
        source: Id,
        edge_type: &str,
        target: Id,
        max_timestamp: i64,
    ) -> GraphResult<EdgeStream> {
        self.load_edges(EdgeSearch::versions(source, edge_type, target).max_timestamp(max_timestamp))
            .await
    }

    pub async fn load_edges_from_source(
        &self,
        source: Id,
        edge_type: &str,
        max_timestamp: i64,
    ) -> GraphResult<EdgeStream> {
        self.load_edges(EdgeSearch::from_source(source, edge_type).max_timestamp(max_timestamp))
            .await
    }

    pub async fn load_edges_from_source_by_type(
        &self,
        source: Id,
        edge_type: &str,
        target_type: &str,
        max_timestamp: i64,
    ) -> GraphResult<EdgeStream> {
        self.load_edges(
            EdgeSearch::from_source_by_target_type(source, edge_type, target_type)
                .max_timestamp(max_timestamp),
        )
        .await
    }

    pub async fn load_edges_to_target(
        &self,
        target: Id,
        edge_type: &str,
        max_timestamp: i64,
    ) -> GraphResult<EdgeStream> {
        self.load_edges(EdgeSearch::to_target(target, edge_type).max_timestamp(max_timestamp))
            .await
    }

    pub async fn load_edges_to_target_by_type(
        &self,
        target: Id,
        edge_type: &str,
        source_type: &str,
        max_timestamp: i64,
    ) -> GraphResult<EdgeStream> {
        self.load_edges(
            EdgeSearch::to_target_by_source_type(target, edge_type, source_type)
                .max_timestamp(max_timestamp),
        )
        .await
    }

    fn listing(&self, search: &TypeSearch, id_types: bool) -> GraphResult<()> {
        search.validate()?;
        match (&search.edge_type, id_types) {
            (Some(edge_type), true) => validate_type(edge_type, "edge type"),
            (None, true) => Err(GraphError::Validation(
                "id type listing needs an edge type".to_string(),
            )),
            (Some(_), false) => Err(GraphError::Validation(
                "edge type listing must not name an edge type".to_string(),
            )),
            (None, false) => Ok(()),
        }
    }

    pub fn get_edge_types_from_source(&self, search: &TypeSearch) -> GraphResult<TypeStream> {
        let timer = self.metrics.time("graph.get_edge_types_from_source");
        self.listing(search, false)?;
        Ok(timed(self.metadata.get_edge_types_from_source(&self.scope, search), timer))
    }

    pub fn get_edge_types_to_target(&self, search: &TypeSearch) -> GraphResult<TypeStream> {
        let timer = self.metrics.time("graph.get_edge_types_to_target");
        self.listing(search, false)?;
        Ok(timed(self.metadata.get_edge_types_to_target(&self.scope, search), timer))
    }

    pub fn get_id_types_from_source(&self, search: &TypeSearch) -> GraphResult<TypeStream> {
        let timer = self.metrics.time("graph.get_id_types_from_source");
        self.listing(search, true)?;
        Ok(timed(self.metadata.get_id_types_from_source(&self.scope, search), timer))
    }

    pub fn get_id_types_to_target(&self, search: &TypeSearch) -> GraphResult<TypeStream> {
        let timer = self.metrics.time("graph.get_id_types_to_target");
        self.listing(search, true)?;
        Ok(timed(self.metadata.get_id_types_to_target(&self.scope, search), timer))
    }

    /// Re-run metadata repair for a tombstone, e.g. after a failed dispatch
    pub fn repair_edge(&self, tombstone: &MarkedEdge) -> GraphResult<()> {
        let _timer = self.metrics.time("graph.repair_edge");
        if !tombstone.is_deleted() {
            return Err(GraphError::Validation(format!(
                "{} is not a tombstone",
                tombstone
            )));
        }
        self.pipeline.dispatch(RepairEvent::EdgeDeleted {
            scope: self.scope.clone(),
            edge: tombstone.clone(),
            timestamp: self.time.current_time(),
        })
    }

    /// Re-run the delete cascade of `node`. A node whose cascade already
    /// finished has no mark left and completes immediately.
    pub fn repair_node(&self, node: &Id) -> GraphResult<()> {
        let _timer = self.metrics.time("graph.repair_node");
        validate_id(node, "node")?;
        self.pipeline.dispatch(RepairEvent::NodeDeleted {
            scope: self.scope.clone(),
            node: node.clone(),
            timestamp: self.time.current_time(),
        })
    }

    pub fn subscribe_repairs(&self) -> broadcast::Receiver<RepairOutcome> {
        self.pipeline.subscribe()
    }
}
