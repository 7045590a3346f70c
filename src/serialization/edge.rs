//! Edge row serialization
//!
//! Every edge version is written to four sharded facets (source, source by
//! target type, target, target by source type) and to one unsharded version
//! row keyed by (source, target, type). Facet columns sort by
//! (timestamp, peer), so a descending scan returns newest first.
//!
//! An edge only ever lives in shards whose index is at or below its
//! timestamp; reads for a cutoff therefore skip every newer shard.

use crate::graph::{
    Edge, EdgeSearch, GraphConfig, GraphResult, Id, MarkedEdge, Scope, SearchMode, TimeService,
};
use crate::persistence::{
    decode_i64, encode_i64, Column, ColumnFamily, ColumnStore, KeyBuilder, MutationBatch,
};
use crate::shard::{
    edge_value, is_deleted_value, DirectedEdgeMeta, MergedShardScan, NodeShardApproximation,
    NodeShardGroupSearch, ShardGroupCompaction,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rustc_hash::FxHashSet;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Pages produced ahead of the consumer
const PREFETCH_PAGES: usize = 2;

/// Edge storage port
#[async_trait]
pub trait EdgeSerialization: Send + Sync {
    /// Mutation writing one edge version to every facet. `timestamp` is the
    /// cell timestamp, not the edge's logical time.
    async fn write_edge(
        &self,
        scope: &Scope,
        edge: &MarkedEdge,
        timestamp: i64,
    ) -> GraphResult<MutationBatch>;

    /// Mutation physically removing one edge version from every facet and
    /// every shard that may hold it
    async fn delete_edge(
        &self,
        scope: &Scope,
        edge: &MarkedEdge,
        timestamp: i64,
    ) -> GraphResult<MutationBatch>;

    /// Raw edge versions, tombstones included, newest first
    async fn get_edges(&self, scope: &Scope, search: &EdgeSearch) -> GraphResult<EdgePages>;
}

/// Pages of marked edges fed by a background producer.
///
/// Dropping the pages stops the producer at its next page boundary.
pub struct EdgePages {
    receiver: mpsc::Receiver<GraphResult<Vec<MarkedEdge>>>,
}

impl EdgePages {
    pub async fn next_page(&mut self) -> Option<GraphResult<Vec<MarkedEdge>>> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> BoxStream<'static, GraphResult<Vec<MarkedEdge>>> {
        ReceiverStream::new(self.receiver).boxed()
    }

    /// One edge at a time
    pub fn into_edges(self) -> BoxStream<'static, GraphResult<MarkedEdge>> {
        self.into_stream()
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    pub async fn collect_all(self) -> GraphResult<Vec<MarkedEdge>> {
        self.into_edges().try_collect().await
    }
}

/// Row of every version of one logical edge
pub fn versions_row_key(scope: &Scope, source: &Id, target: &Id, edge_type: &str) -> Vec<u8> {
    KeyBuilder::new()
        .scope(scope)
        .id(source)
        .id(target)
        .string(edge_type)
        .build()
}

/// Where a search reads from and how its columns decode
enum Facet {
    Sharded(DirectedEdgeMeta),
    Versions { edge: Edge },
}

impl Facet {
    fn for_search(search: &EdgeSearch) -> Self {
        let node = search.node.clone();
        let edge_type = search.edge_type.clone();
        match &search.mode {
            SearchMode::FromSource => Facet::Sharded(DirectedEdgeMeta::from_source(node, edge_type)),
            SearchMode::ToTarget => Facet::Sharded(DirectedEdgeMeta::to_target(node, edge_type)),
            SearchMode::FromSourceByTargetType(t) => Facet::Sharded(
                DirectedEdgeMeta::from_source_with_target_type(node, edge_type, t.clone()),
            ),
            SearchMode::ToTargetBySourceType(t) => Facet::Sharded(
                DirectedEdgeMeta::to_target_with_source_type(node, edge_type, t.clone()),
            ),
            SearchMode::Versions { target } => Facet::Versions {
                edge: Edge::new(node, edge_type, target.clone(), 0),
            },
        }
    }

    fn decode(&self, column: &Column) -> GraphResult<MarkedEdge> {
        match self {
            Facet::Sharded(meta) => Ok(meta.decode(column)?),
            Facet::Versions { edge } => Ok(MarkedEdge::new(
                Edge {
                    timestamp: decode_i64(&column.name)?,
                    ..edge.clone()
                },
                is_deleted_value(&column.value)?,
            )),
        }
    }

    /// Greatest column name a search may return, exclusive
    fn upper_bound(&self, search: &EdgeSearch) -> Bound<Vec<u8>> {
        let max = search.max_timestamp;
        match &search.last {
            Some(last) if last.timestamp <= max => Bound::Excluded(match self {
                Facet::Sharded(meta) => meta.column_name(last),
                Facet::Versions { .. } => encode_i64(last.timestamp).to_vec(),
            }),
            _ if max == i64::MAX => Bound::Unbounded,
            _ => Bound::Excluded(encode_i64(max + 1).to_vec()),
        }
    }
}

pub struct ShardedEdgeSerialization {
    store: Arc<dyn ColumnStore>,
    search: NodeShardGroupSearch,
    counter: NodeShardApproximation,
    compaction: Option<Arc<ShardGroupCompaction>>,
    config: Arc<GraphConfig>,
    time: Arc<dyn TimeService>,
}

impl ShardedEdgeSerialization {
    pub fn new(
        store: Arc<dyn ColumnStore>,
        search: NodeShardGroupSearch,
        counter: NodeShardApproximation,
        compaction: Option<Arc<ShardGroupCompaction>>,
        config: Arc<GraphConfig>,
        time: Arc<dyn TimeService>,
    ) -> Self {
        ShardedEdgeSerialization {
            store,
            search,
            counter,
            compaction,
            config,
            time,
        }
    }

    /// Rows of `meta` in every shard that may hold an edge at or below `max`
    async fn read_rows(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
        max: i64,
    ) -> GraphResult<Vec<Vec<u8>>> {
        let groups = self.search.get_read_shard_groups(scope, max, meta).await?;
        let mut seen = FxHashSet::default();
        let mut rows = Vec::new();
        for group in &groups {
            for shard in group.read_shards() {
                if shard.shard_index() <= max && seen.insert(shard.shard_index()) {
                    rows.push(meta.row_key(scope, &shard));
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl EdgeSerialization for ShardedEdgeSerialization {
    async fn write_edge(
        &self,
        scope: &Scope,
        edge: &MarkedEdge,
        timestamp: i64,
    ) -> GraphResult<MutationBatch> {
        let now = self.time.current_time();
        let mut batch = MutationBatch::new();

        for meta in DirectedEdgeMeta::for_edge(edge) {
            let group = self
                .search
                .get_write_shard_group(scope, edge.timestamp, &meta)
                .await?;
            for shard in group.write_shards_for(now, edge.timestamp) {
                meta.write_edge(&mut batch, scope, &shard, edge, timestamp);
                if !edge.is_deleted() {
                    self.counter.increment(&mut batch, scope, &shard, &meta, 1);
                }
            }
            if let Some(compaction) = &self.compaction {
                compaction.schedule(scope, &meta, group);
            }
        }

        batch.put(
            ColumnFamily::EdgeVersions,
            versions_row_key(scope, &edge.source, &edge.target, &edge.edge_type),
            encode_i64(edge.timestamp).to_vec(),
            edge_value(edge.is_deleted()),
            timestamp,
        );
        Ok(batch)
    }

    async fn delete_edge(
        &self,
        scope: &Scope,
        edge: &MarkedEdge,
        timestamp: i64,
    ) -> GraphResult<MutationBatch> {
        let mut batch = MutationBatch::new();
        for meta in DirectedEdgeMeta::for_edge(edge) {
            let groups = self
                .search
                .get_read_shard_groups(scope, edge.timestamp, &meta)
                .await?;
            let mut seen = FxHashSet::default();
            for shard in groups.iter().flat_map(|g| g.read_shards()) {
                if shard.shard_index() <= edge.timestamp && seen.insert(shard.shard_index()) {
                    meta.delete_edge(&mut batch, scope, &shard, edge, timestamp);
                }
            }
        }

        batch.delete(
            ColumnFamily::EdgeVersions,
            versions_row_key(scope, &edge.source, &edge.target, &edge.edge_type),
            encode_i64(edge.timestamp).to_vec(),
            timestamp,
        );
        Ok(batch)
    }

    async fn get_edges(&self, scope: &Scope, search: &EdgeSearch) -> GraphResult<EdgePages> {
        let facet = Facet::for_search(search);
        let (cf, rows) = match &facet {
            Facet::Sharded(meta) => (
                meta.column_family(),
                self.read_rows(scope, meta, search.max_timestamp).await?,
            ),
            Facet::Versions { edge } => (
                ColumnFamily::EdgeVersions,
                vec![versions_row_key(scope, &edge.source, &edge.target, &edge.edge_type)],
            ),
        };
        debug!(
            "Scanning {} rows of {} for {} [{}]",
            rows.len(),
            cf,
            search.node,
            search.edge_type
        );

        let mut scan = MergedShardScan::descending(
            self.store.clone(),
            cf,
            rows,
            Bound::Unbounded,
            facet.upper_bound(search),
            self.config.scan_page_size,
        );

        let (sender, receiver) = mpsc::channel(PREFETCH_PAGES);
        tokio::spawn(async move {
            loop {
                let page = match scan.next_page().await {
                    Ok(columns) if columns.is_empty() => break,
                    Ok(columns) => columns
                        .iter()
                        .map(|column| facet.decode(column))
                        .collect::<GraphResult<Vec<MarkedEdge>>>(),
                    Err(e) => Err(e.into()),
                };
                let failed = page.is_err();
                if sender.send(page).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(EdgePages { receiver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ManualTimeService;
    use crate::persistence::{ColumnRange, MemoryColumnStore};
    use crate::shard::{EdgeShardSerialization, NodeShardAllocation, Shard};

    struct Fixture {
        store: Arc<MemoryColumnStore>,
        shards: EdgeShardSerialization,
        counter: NodeShardApproximation,
        search: NodeShardGroupSearch,
        edges: ShardedEdgeSerialization,
        scope: Scope,
    }

    fn fixture(page_size: usize) -> Fixture {
        let store = Arc::new(MemoryColumnStore::new());
        let clock = Arc::new(ManualTimeService::new(1_000));
        let config = Arc::new(GraphConfig {
            scan_page_size: page_size,
            ..GraphConfig::default()
        });
        let shards = EdgeShardSerialization::new(store.clone());
        let counter = NodeShardApproximation::new(store.clone());
        let allocation = NodeShardAllocation::new(
            shards.clone(),
            counter.clone(),
            store.clone(),
            clock.clone(),
            config.clone(),
        );
        let search = NodeShardGroupSearch::new(allocation, &config, clock.clone());
        let edges = ShardedEdgeSerialization::new(
            store.clone(),
            search.clone(),
            counter.clone(),
            None,
            config,
            clock,
        );
        Fixture {
            store,
            shards,
            counter,
            search,
            edges,
            scope: Scope::new(Id::generate("application")),
        }
    }

    async fn write(f: &Fixture, edge: &Edge, deleted: bool) {
        let batch = f
            .edges
            .write_edge(&f.scope, &MarkedEdge::new(edge.clone(), deleted), 1_000)
            .await
            .unwrap();
        f.store.execute(batch).await.unwrap();
    }

    async fn load(f: &Fixture, search: EdgeSearch) -> Vec<MarkedEdge> {
        f.edges.get_edges(&f.scope, &search).await.unwrap().collect_all().await.unwrap()
    }

    #[tokio::test]
    async fn test_edge_is_readable_from_every_facet() {
        let f = fixture(10);
        let a = Id::generate("user");
        let b = Id::generate("post");
        let edge = Edge::new(a.clone(), "likes", b.clone(), 100);
        write(&f, &edge, false).await;

        for search in [
            EdgeSearch::from_source(a.clone(), "likes"),
            EdgeSearch::to_target(b.clone(), "likes"),
            EdgeSearch::from_source_by_target_type(a.clone(), "likes", "post"),
            EdgeSearch::to_target_by_source_type(b.clone(), "likes", "user"),
            EdgeSearch::versions(a.clone(), "likes", b.clone()),
        ] {
            let found = load(&f, search).await;
            assert_eq!(found, vec![MarkedEdge::new(edge.clone(), false)]);
        }

        assert!(load(&f, EdgeSearch::from_source_by_target_type(a, "likes", "user")).await.is_empty());
        let meta = DirectedEdgeMeta::from_source(edge.source.clone(), "likes");
        assert_eq!(f.counter.get_count(&f.scope, &Shard::root(), &meta).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pages_descend_and_honor_cutoff_and_cursor() {
        let f = fixture(2);
        let a = Id::generate("user");
        let edges: Vec<Edge> = (1..=5)
            .map(|ts| Edge::new(a.clone(), "likes", Id::generate("post"), ts * 10))
            .collect();
        for edge in &edges {
            write(&f, edge, false).await;
        }

        let all = load(&f, EdgeSearch::from_source(a.clone(), "likes")).await;
        let timestamps: Vec<i64> = all.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![50, 40, 30, 20, 10]);

        let cut = load(&f, EdgeSearch::from_source(a.clone(), "likes").max_timestamp(30)).await;
        assert_eq!(cut.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![30, 20, 10]);

        let resumed = load(
            &f,
            EdgeSearch::from_source(a.clone(), "likes").after(edges[3].clone()),
        )
        .await;
        assert_eq!(resumed.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![30, 20, 10]);

        let mut pages = f
            .edges
            .get_edges(&f.scope, &EdgeSearch::from_source(a, "likes"))
            .await
            .unwrap();
        assert_eq!(pages.next_page().await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reads_merge_shards_and_skip_newer_ones() {
        let f = fixture(10);
        let a = Id::generate("user");
        let meta = DirectedEdgeMeta::from_source(a.clone(), "likes");
        let future = Shard::new(500, 900, false);

        // Bucket with a root and a second shard at index 500
        f.search.get_read_shard_groups(&f.scope, 0, &meta).await.unwrap();
        f.store
            .execute(f.shards.write_shard_meta(&f.scope, &future, &meta).unwrap())
            .await
            .unwrap();
        f.search.invalidate(&f.scope, &meta).await;

        let old = Edge::new(a.clone(), "likes", Id::generate("post"), 100);
        let new = Edge::new(a.clone(), "likes", Id::generate("post"), 600);
        write(&f, &old, false).await;
        write(&f, &new, false).await;

        // The old edge never lands in the shard at 500
        let row = meta.row_key(&f.scope, &future);
        let in_future = f
            .store
            .scan(meta.column_family(), &row, &ColumnRange::all())
            .await
            .unwrap();
        assert_eq!(in_future.len(), 1);

        let all = load(&f, EdgeSearch::from_source(a.clone(), "likes")).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp, 600);

        let early = load(&f, EdgeSearch::from_source(a, "likes").max_timestamp(200)).await;
        assert_eq!(early, vec![MarkedEdge::new(old, false)]);
    }

    #[tokio::test]
    async fn test_delete_edge_removes_every_copy() {
        let f = fixture(10);
        let a = Id::generate("user");
        let b = Id::generate("post");
        let edge = Edge::new(a.clone(), "likes", b.clone(), 100);
        write(&f, &edge, false).await;

        let batch = f
            .edges
            .delete_edge(&f.scope, &MarkedEdge::new(edge, false), 2_000)
            .await
            .unwrap();
        f.store.execute(batch).await.unwrap();

        assert!(load(&f, EdgeSearch::from_source(a.clone(), "likes")).await.is_empty());
        assert!(load(&f, EdgeSearch::to_target(b.clone(), "likes")).await.is_empty());
        assert!(load(&f, EdgeSearch::versions(a, "likes", b)).await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_reaches_consumer() {
        let f = fixture(10);
        let a = Id::generate("user");
        write(&f, &Edge::new(a.clone(), "likes", Id::generate("post"), 1), false).await;

        let pages = f
            .edges
            .get_edges(&f.scope, &EdgeSearch::from_source(a, "likes"))
            .await
            .unwrap();
        f.store.set_unavailable(true);
        assert!(pages.collect_all().await.is_err());
    }
}
