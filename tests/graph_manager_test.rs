//! Integration tests for the graph manager
//!
//! Drives writes, deletes, point-in-time reads and the background repair
//! pipeline end to end over the in-memory store.

use futures::TryStreamExt;
use shardgraph::graph::{
    Edge, EdgeSearch, GraphConfig, GraphEngine, GraphError, GraphManager, Id, ManualTimeService,
    Scope, TypeSearch,
};
use shardgraph::metrics::{ObservabilityContext, RecordingMetricsSink};
use shardgraph::persistence::MemoryColumnStore;
use shardgraph::repair::RepairOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct TestGraph {
    store: Arc<MemoryColumnStore>,
    engine: GraphEngine,
    graph: GraphManager,
    sink: Arc<RecordingMetricsSink>,
}

fn setup(config: GraphConfig) -> TestGraph {
    let store = Arc::new(MemoryColumnStore::new());
    let sink = Arc::new(RecordingMetricsSink::new());
    let engine = GraphEngine::new(
        store.clone(),
        config,
        Arc::new(ManualTimeService::new(10_000)),
        ObservabilityContext::new(sink.clone()),
    )
    .unwrap();
    let graph = engine.graph_manager(Scope::new(Id::generate("application")));
    TestGraph {
        store,
        engine,
        graph,
        sink,
    }
}

fn config() -> GraphConfig {
    GraphConfig {
        scan_page_size: 2,
        shard_repair_chance: 0.0,
        ..GraphConfig::default()
    }
}

async fn from_source(graph: &GraphManager, node: &Id, edge_type: &str, max: i64) -> Vec<Edge> {
    graph
        .load_edges_from_source(node.clone(), edge_type, max)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

async fn edge_types_from(graph: &GraphManager, node: &Id) -> Vec<String> {
    graph
        .get_edge_types_from_source(&TypeSearch::edge_types(node.clone()))
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

/// Wait for the first outcome `matches` accepts
async fn wait_for<F>(outcomes: &mut broadcast::Receiver<RepairOutcome>, matches: F) -> RepairOutcome
where
    F: Fn(&RepairOutcome) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let outcome = outcomes.recv().await.unwrap();
            if matches(&outcome) {
                return outcome;
            }
        }
    })
    .await
    .expect("repair did not finish in time")
}

#[tokio::test]
async fn test_written_edge_is_visible() {
    let t = setup(config());
    let a = Id::generate("user");
    let b = Id::generate("post");

    let edge = t
        .graph
        .write_edge(Edge::new(a.clone(), "likes", b.clone(), 100))
        .await
        .unwrap();

    let seen = from_source(&t.graph, &a, "likes", 200).await;
    assert_eq!(seen, vec![edge.clone()]);
    assert_eq!(seen[0].timestamp, 100);

    let inbound: Vec<Edge> = t
        .graph
        .load_edges_to_target_by_type(b.clone(), "likes", "user", i64::MAX)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(inbound, vec![edge]);
    assert_eq!(edge_types_from(&t.graph, &a).await, vec!["likes"]);
}

#[tokio::test]
async fn test_deleted_edge_is_hidden_above_its_timestamp() {
    let t = setup(config());
    let a = Id::generate("user");
    let b = Id::generate("post");
    let edge = t
        .graph
        .write_edge(Edge::new(a.clone(), "likes", b.clone(), 100))
        .await
        .unwrap();

    let mut outcomes = t.graph.subscribe_repairs();
    let tombstone = t.graph.delete_edge(&edge).await.unwrap();
    assert_eq!(tombstone.timestamp, 101);
    assert!(tombstone.is_deleted());

    assert!(from_source(&t.graph, &a, "likes", 200).await.is_empty());
    assert!(from_source(&t.graph, &a, "likes", 101).await.is_empty());
    assert_eq!(from_source(&t.graph, &a, "likes", 100).await, vec![edge]);

    wait_for(&mut outcomes, |o| matches!(o, RepairOutcome::EdgeRepaired { .. })).await;
    assert!(edge_types_from(&t.graph, &a).await.is_empty());
}

/// Delete `edge` and wait for its repair to finish
async fn delete_and_repair(t: &TestGraph, edge: &Edge) {
    let mut outcomes = t.graph.subscribe_repairs();
    let tombstone = t.graph.delete_edge(edge).await.unwrap();
    wait_for(&mut outcomes, |o| {
        matches!(o, RepairOutcome::EdgeRepaired { edge, .. } if *edge == tombstone)
    })
    .await;
}

#[tokio::test]
async fn test_deleting_newest_first_clears_source_types() {
    let t = setup(config());
    let a = Id::generate("user");
    let newer = t
        .graph
        .write_edge(Edge::new(a.clone(), "likes", Id::generate("post"), 500))
        .await
        .unwrap();
    let older = t
        .graph
        .write_edge(Edge::new(a.clone(), "likes", Id::generate("post"), 100))
        .await
        .unwrap();

    delete_and_repair(&t, &newer).await;
    assert_eq!(edge_types_from(&t.graph, &a).await, vec!["likes"]);
    delete_and_repair(&t, &older).await;

    assert!(from_source(&t.graph, &a, "likes", i64::MAX).await.is_empty());
    assert!(edge_types_from(&t.graph, &a).await.is_empty());
    let id_types: Vec<String> = t
        .graph
        .get_id_types_from_source(&TypeSearch::id_types(a, "likes"))
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(id_types.is_empty());
}

#[tokio::test]
async fn test_deleting_newest_first_clears_target_types() {
    let t = setup(config());
    let b = Id::generate("post");
    let newer = t
        .graph
        .write_edge(Edge::new(Id::generate("user"), "likes", b.clone(), 500))
        .await
        .unwrap();
    let older = t
        .graph
        .write_edge(Edge::new(Id::generate("user"), "likes", b.clone(), 100))
        .await
        .unwrap();

    delete_and_repair(&t, &newer).await;
    delete_and_repair(&t, &older).await;

    let edge_types: Vec<String> = t
        .graph
        .get_edge_types_to_target(&TypeSearch::edge_types(b.clone()))
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(edge_types.is_empty());
    let id_types: Vec<String> = t
        .graph
        .get_id_types_to_target(&TypeSearch::id_types(b, "likes"))
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(id_types.is_empty());
}

#[tokio::test]
async fn test_edge_versions_read_newest_first() {
    let t = setup(config());
    let a = Id::generate("user");
    let b = Id::generate("post");
    for ts in [100, 200, 300] {
        t.graph
            .write_edge(Edge::new(a.clone(), "likes", b.clone(), ts))
            .await
            .unwrap();
    }

    let versions: Vec<i64> = t
        .graph
        .load_edge_versions(a.clone(), "likes", b.clone(), 250)
        .await
        .unwrap()
        .map_ok(|edge| edge.timestamp)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(versions, vec![200, 100]);
}

#[tokio::test]
async fn test_scan_resumes_from_cursor() {
    let t = setup(config());
    let a = Id::generate("user");
    let mut written = Vec::new();
    for ts in 1..=5 {
        let edge = Edge::new(a.clone(), "follows", Id::generate("user"), ts * 10);
        written.push(t.graph.write_edge(edge).await.unwrap());
    }
    written.reverse();

    let all = from_source(&t.graph, &a, "follows", i64::MAX).await;
    assert_eq!(all, written);

    let rest: Vec<Edge> = t
        .graph
        .load_edges(EdgeSearch::from_source(a.clone(), "follows").after(all[2].clone()))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rest, written[3..].to_vec());
}

#[tokio::test]
async fn test_node_delete_cascades_over_edges() {
    let t = setup(config());
    let a = Id::generate("user");
    let b = Id::generate("user");
    let c = Id::generate("user");
    let d = Id::generate("user");
    t.graph
        .write_edge(Edge::new(a.clone(), "follows", b.clone(), 100))
        .await
        .unwrap();
    t.graph
        .write_edge(Edge::new(a.clone(), "follows", c.clone(), 110))
        .await
        .unwrap();
    // b keeps an unrelated inbound edge
    t.graph
        .write_edge(Edge::new(d.clone(), "follows", b.clone(), 120))
        .await
        .unwrap();

    let mut outcomes = t.graph.subscribe_repairs();
    let version = t.graph.delete_node(&a).await.unwrap();
    assert_eq!(version, 10_000);

    // Hidden by the mark before the cascade runs
    assert!(from_source(&t.graph, &a, "follows", i64::MAX).await.is_empty());

    let outcome = wait_for(&mut outcomes, |o| {
        matches!(o, RepairOutcome::NodeRepaired { node, .. } if *node == a)
    })
    .await;
    assert!(matches!(outcome, RepairOutcome::NodeRepaired { edges: 2, .. }));

    assert!(from_source(&t.graph, &a, "follows", i64::MAX).await.is_empty());
    assert!(edge_types_from(&t.graph, &a).await.is_empty());

    let into_b: Vec<String> = t
        .graph
        .get_id_types_to_target(&TypeSearch::id_types(b.clone(), "follows"))
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(into_b, vec!["user"]);
    let into_c: Vec<String> = t
        .graph
        .get_edge_types_to_target(&TypeSearch::edge_types(c.clone()))
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(into_c.is_empty());

    // Re-dispatching a finished cascade is a no-op
    t.graph.repair_node(&a).unwrap();
    let again = wait_for(&mut outcomes, |o| {
        matches!(o, RepairOutcome::NodeRepaired { node, .. } if *node == a)
    })
    .await;
    assert!(matches!(again, RepairOutcome::NodeRepaired { edges: 0, .. }));
}

#[tokio::test]
async fn test_invalid_input_never_reaches_storage() {
    let t = setup(config());
    let blank = Edge::new(Id::generate("user"), " ", Id::generate("post"), 100);
    assert!(matches!(
        t.graph.write_edge(blank).await,
        Err(GraphError::Validation(_))
    ));

    let negative = EdgeSearch::from_source(Id::generate("user"), "likes").max_timestamp(-1);
    assert!(matches!(
        t.graph.load_edges(negative).await,
        Err(GraphError::Validation(_))
    ));
    assert!(t
        .graph
        .get_id_types_from_source(&TypeSearch::edge_types(Id::generate("user")))
        .is_err());
    assert_eq!(t.store.executed_batches(), 0);
}

#[tokio::test]
async fn test_storage_failure_surfaces_as_operation_failed() {
    let t = setup(config());
    t.store.set_unavailable(true);

    let result = t
        .graph
        .write_edge(Edge::new(Id::generate("user"), "likes", Id::generate("post"), 100))
        .await;
    match result {
        Err(err @ GraphError::Storage(_)) => {
            assert!(err.to_string().starts_with("Operation failed"));
            assert!(!err.is_retryable());
        }
        other => panic!("expected a storage error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_delete_after_shutdown_keeps_tombstone() {
    let t = setup(config());
    let a = Id::generate("user");
    let edge = t
        .graph
        .write_edge(Edge::new(a.clone(), "likes", Id::generate("post"), 100))
        .await
        .unwrap();

    t.engine.shutdown();
    assert!(matches!(
        t.graph.delete_edge(&edge).await,
        Err(GraphError::RepairUnavailable(_))
    ));

    // The tombstone committed before the dispatch failed
    assert!(from_source(&t.graph, &a, "likes", i64::MAX).await.is_empty());
    assert_eq!(edge_types_from(&t.graph, &a).await, vec!["likes"]);
}

#[tokio::test]
async fn test_operations_are_measured() {
    let t = setup(config());
    let a = Id::generate("user");
    t.graph
        .write_edge(Edge::new(a.clone(), "likes", Id::generate("post"), 100))
        .await
        .unwrap();
    assert_eq!(t.sink.count_of("graph.write_edge"), 1);
    assert_eq!(t.sink.samples_of("graph.write_edge"), 1);

    // A read is measured until its stream is dropped
    let stream = t
        .graph
        .load_edges_from_source(a.clone(), "likes", i64::MAX)
        .await
        .unwrap();
    assert_eq!(t.sink.count_of("graph.load_edges"), 1);
    assert_eq!(t.sink.samples_of("graph.load_edges"), 0);
    let edges: Vec<Edge> = stream.try_collect().await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(t.sink.samples_of("graph.load_edges"), 1);

    edge_types_from(&t.graph, &a).await;
    assert_eq!(t.sink.samples_of("graph.get_edge_types_from_source"), 1);
    assert_eq!(t.sink.count_of("graph.delete_edge"), 0);
}
