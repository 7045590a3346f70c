//! Integration tests for shard allocation, grouping and compaction

use futures::future::join_all;
use futures::TryStreamExt;
use shardgraph::graph::{
    Edge, GraphConfig, GraphEngine, GraphError, Id, ManualTimeService, Scope,
};
use shardgraph::metrics::ObservabilityContext;
use shardgraph::persistence::{MemoryColumnStore, MutationBatch};
use shardgraph::shard::{
    AuditResult, DirectedEdgeMeta, EdgeShardSerialization, NodeShardApproximation, Shard,
    ShardEntryGroup,
};
use shardgraph::ColumnStore;
use std::sync::Arc;

const NOW: i64 = 1_000_000;

struct Harness {
    store: Arc<MemoryColumnStore>,
    clock: Arc<ManualTimeService>,
    engine: GraphEngine,
    scope: Scope,
}

fn harness(shard_size: i64) -> Harness {
    let store = Arc::new(MemoryColumnStore::new());
    let clock = Arc::new(ManualTimeService::new(NOW));
    let engine = GraphEngine::new(
        store.clone(),
        GraphConfig {
            shard_size,
            shard_repair_chance: 0.0,
            scan_page_size: 2,
            ..GraphConfig::default()
        },
        clock.clone(),
        ObservabilityContext::default(),
    )
    .unwrap();
    Harness {
        store,
        clock,
        engine,
        scope: Scope::new(Id::generate("application")),
    }
}

async fn shard_indexes(h: &Harness, meta: &DirectedEdgeMeta) -> Vec<i64> {
    EdgeShardSerialization::new(h.store.clone())
        .get_shard_meta_data(&h.scope, meta)
        .await
        .unwrap()
        .iter()
        .map(Shard::shard_index)
        .collect()
}

#[test]
fn test_compaction_waits_for_target_delta() {
    let mut root = ShardEntryGroup::new(10_000);
    assert!(root.add_shard(Shard::root()).unwrap());
    assert!(!root.should_compact(i64::MAX));

    let mut group = ShardEntryGroup::new(10_000);
    assert!(group.add_shard(Shard::new(1000, 1000, false)).unwrap());
    assert!(group.add_shard(Shard::new(1001, 1001, false)).unwrap());
    assert_eq!(group.compaction_target().map(|s| s.shard_index()), Some(1000));
    assert!(!group.should_compact(10_999));
    assert!(group.should_compact(11_001));
    assert!(group.read_shards().iter().any(|s| s.shard_index() == 1000));

    assert!(matches!(
        group.add_shard(Shard::new(999, 2000, false)),
        Err(GraphError::ShardOrder { .. })
    ));
}

#[tokio::test]
async fn test_busy_bucket_gets_a_future_shard() {
    let h = harness(3);
    let graph = h.engine.graph_manager(h.scope.clone());
    let a = Id::generate("user");
    let meta = DirectedEdgeMeta::from_source_with_target_type(a.clone(), "likes", "post");

    // Never written: nothing to audit
    assert!(!h.engine.allocation().audit_max_shard(&h.scope, &meta).await.unwrap());

    for ts in [100, 200, 300] {
        graph
            .write_edge(Edge::new(a.clone(), "likes", Id::generate("post"), ts))
            .await
            .unwrap();
    }

    assert!(h.engine.allocation().audit_max_shard(&h.scope, &meta).await.unwrap());
    let lookahead = h.engine.config().shard_lookahead_ms();
    assert_eq!(shard_indexes(&h, &meta).await, vec![NOW + lookahead, 0]);
    // The new shard is in the future, so a second audit does nothing
    assert!(!h.engine.allocation().audit_max_shard(&h.scope, &meta).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_audits_allocate_one_shard() {
    let h = harness(5);
    let meta = DirectedEdgeMeta::from_source(Id::generate("user"), "likes");
    h.engine.allocation().get_shards(&h.scope, &meta).await.unwrap();

    let counter = NodeShardApproximation::new(h.store.clone());
    let mut batch = MutationBatch::new();
    counter.increment(&mut batch, &h.scope, &Shard::root(), &meta, 4);
    h.store.execute(batch).await.unwrap();

    let below = join_all((0..8).map(|_| h.engine.allocation().audit_max_shard(&h.scope, &meta))).await;
    assert!(below.into_iter().all(|created| !created.unwrap()));
    assert_eq!(shard_indexes(&h, &meta).await, vec![0]);

    let mut batch = MutationBatch::new();
    counter.increment(&mut batch, &h.scope, &Shard::root(), &meta, 1);
    h.store.execute(batch).await.unwrap();

    let at = join_all((0..8).map(|_| h.engine.allocation().audit_max_shard(&h.scope, &meta))).await;
    assert!(at.into_iter().any(|created| created.unwrap()));
    assert_eq!(shard_indexes(&h, &meta).await.len(), 2);
}

#[tokio::test]
async fn test_duplicate_future_shards_are_pruned_on_read() {
    let h = harness(5);
    let meta = DirectedEdgeMeta::to_target(Id::generate("post"), "likes");
    let shards = EdgeShardSerialization::new(h.store.clone());
    let horizon = NOW + h.engine.config().shard_cache_timeout_ms;

    let mut batch = MutationBatch::new();
    for shard in [
        Shard::root(),
        Shard::new(NOW - 5_000, NOW - 65_000, false),
        Shard::new(horizon + 10, NOW, false),
        Shard::new(horizon + 20, NOW, false),
        Shard::new(horizon + 30, NOW, false),
    ] {
        batch.merge(shards.write_shard_meta(&h.scope, &shard, &meta).unwrap());
    }
    h.store.execute(batch).await.unwrap();

    let groups = h.engine.allocation().get_shards(&h.scope, &meta).await.unwrap();
    let read: Vec<i64> = groups
        .iter()
        .flat_map(|g| g.shards().iter().map(Shard::shard_index))
        .collect();
    assert_eq!(read, vec![0, NOW - 5_000, horizon + 10]);
    assert_eq!(
        shard_indexes(&h, &meta).await,
        vec![horizon + 10, NOW - 5_000, 0]
    );
}

#[tokio::test]
async fn test_group_is_compacted_into_new_shard() {
    let h = harness(3);
    let graph = h.engine.graph_manager(h.scope.clone());
    let a = Id::generate("user");
    let meta = DirectedEdgeMeta::from_source(a.clone(), "follows");

    for ts in [100, 200, 300] {
        graph
            .write_edge(Edge::new(a.clone(), "follows", Id::generate("user"), ts))
            .await
            .unwrap();
    }

    let groups = h.engine.allocation().get_shards(&h.scope, &meta).await.unwrap();
    let audit = h
        .engine
        .compaction()
        .evaluate_shard_group(&h.scope, &meta, &groups[0])
        .await
        .unwrap();
    assert_eq!(audit, AuditResult::CheckedCreated);
    let target = NOW + h.engine.config().shard_lookahead_ms();

    // While the group is new, an edge above the target lands in both shards
    let late = graph
        .write_edge(Edge::new(a.clone(), "follows", Id::generate("user"), target + 5_000))
        .await
        .unwrap();

    let groups = h.engine.allocation().get_shards(&h.scope, &meta).await.unwrap();
    let group = groups.last().unwrap().clone();
    assert_eq!(group.compaction_target().map(|s| s.shard_index()), Some(target));
    assert!(matches!(
        h.engine.compaction().compact(&h.scope, &meta, &group).await,
        Err(GraphError::CompactionTooEarly { .. })
    ));

    h.clock.set(target + 10_000);
    let result = h.engine.compaction().compact(&h.scope, &meta, &group).await.unwrap();
    assert_eq!(result.total_copied(), 1);
    assert_eq!(result.target.shard_index(), target);
    assert!(result.compacted.is_some_and(|s| s.is_compacted()));
    // The root is never removed
    assert!(result.removed.is_empty());

    let edges: Vec<Edge> = graph
        .load_edges_from_source(a.clone(), "follows", i64::MAX)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(edges.len(), 4);
    assert_eq!(edges[0], late);

    let groups = h.engine.allocation().get_shards(&h.scope, &meta).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| !g.is_compaction_pending()));
}
