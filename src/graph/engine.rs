//! Component wiring
//!
//! One engine per backing store. It owns the shard components, the
//! serializers and the repair worker, and hands out cheap per-scope
//! [`GraphManager`]s that share them.

use super::config::GraphConfig;
use super::error::GraphResult;
use super::manager::GraphManager;
use super::time::TimeService;
use super::types::Scope;
use crate::metrics::ObservabilityContext;
use crate::persistence::ColumnStore;
use crate::repair::{
    EdgeDeleteRepair, EdgeMetaRepair, NodeDeleteRepair, RepairOutcome, RepairPipeline,
};
use crate::serialization::{
    EdgeMetadataSerialization, EdgeSerialization, NodeSerialization, ShardedEdgeSerialization,
};
use crate::shard::{
    EdgeShardSerialization, NodeShardAllocation, NodeShardApproximation, NodeShardGroupSearch,
    ShardGroupCompaction,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub struct GraphEngine {
    store: Arc<dyn ColumnStore>,
    config: Arc<GraphConfig>,
    time: Arc<dyn TimeService>,
    metrics: ObservabilityContext,
    allocation: NodeShardAllocation,
    search: NodeShardGroupSearch,
    compaction: Arc<ShardGroupCompaction>,
    edges: Arc<ShardedEdgeSerialization>,
    metadata: EdgeMetadataSerialization,
    nodes: NodeSerialization,
    pipeline: Arc<RepairPipeline>,
}

impl GraphEngine {
    /// Wire every component over `store` and start the repair worker.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(
        store: Arc<dyn ColumnStore>,
        config: GraphConfig,
        time: Arc<dyn TimeService>,
        metrics: ObservabilityContext,
    ) -> GraphResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let shards = EdgeShardSerialization::new(store.clone());
        let counter = NodeShardApproximation::new(store.clone());
        let allocation = NodeShardAllocation::new(
            shards.clone(),
            counter.clone(),
            store.clone(),
            time.clone(),
            config.clone(),
        );
        let search = NodeShardGroupSearch::new(allocation.clone(), &config, time.clone());
        let compaction = Arc::new(ShardGroupCompaction::new(
            store.clone(),
            allocation.clone(),
            search.clone(),
            shards,
            counter.clone(),
            config.clone(),
            time.clone(),
        ));
        let edges = Arc::new(ShardedEdgeSerialization::new(
            store.clone(),
            search.clone(),
            counter,
            Some(compaction.clone()),
            config.clone(),
            time.clone(),
        ));
        let metadata = EdgeMetadataSerialization::new(store.clone(), config.scan_page_size);
        let nodes = NodeSerialization::new(store.clone());

        let edge_reader: Arc<dyn EdgeSerialization> = edges.clone();
        let edge_delete =
            EdgeDeleteRepair::new(store.clone(), edge_reader.clone(), metadata.clone());
        let meta = EdgeMetaRepair::new(
            store.clone(),
            edge_reader.clone(),
            metadata.clone(),
            config.repair_concurrent_size,
        );
        let node_delete = NodeDeleteRepair::new(
            store.clone(),
            edge_reader,
            metadata.clone(),
            nodes.clone(),
            edge_delete.clone(),
            meta,
            config.clone(),
        );
        let pipeline = Arc::new(RepairPipeline::start(edge_delete, node_delete, &config)?);

        info!(
            "Graph engine ready: shard size {}, cache timeout {}ms, lookahead {}ms",
            config.shard_size,
            config.shard_cache_timeout_ms,
            config.shard_lookahead_ms()
        );

        Ok(GraphEngine {
            store,
            config,
            time,
            metrics,
            allocation,
            search,
            compaction,
            edges,
            metadata,
            nodes,
            pipeline,
        })
    }

    pub fn graph_manager(&self, scope: Scope) -> GraphManager {
        GraphManager::new(
            scope,
            self.store.clone(),
            self.edges.clone(),
            self.metadata.clone(),
            self.nodes.clone(),
            self.pipeline.clone(),
            self.time.clone(),
            self.metrics.clone(),
        )
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn allocation(&self) -> &NodeShardAllocation {
        &self.allocation
    }

    pub fn shard_search(&self) -> &NodeShardGroupSearch {
        &self.search
    }

    pub fn compaction(&self) -> &Arc<ShardGroupCompaction> {
        &self.compaction
    }

    pub fn edge_serialization(&self) -> &Arc<ShardedEdgeSerialization> {
        &self.edges
    }

    /// Outcomes of every repair, across all scopes
    pub fn subscribe_repairs(&self) -> broadcast::Receiver<RepairOutcome> {
        self.pipeline.subscribe()
    }

    /// Stop accepting repairs. Queued repairs still run; later deletes still
    /// write their tombstones but fail with `RepairUnavailable`.
    pub fn shutdown(&self) {
        self.pipeline.shutdown();
    }

    /// Wait for the repairs queued before [`GraphEngine::shutdown`]
    pub async fn drained(&self) {
        self.pipeline.drained().await;
    }
}
