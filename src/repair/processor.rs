//! Background repair pipeline
//!
//! Events are queued on an unbounded channel and drained by one worker loop.
//! Each event runs on its own task; a semaphore caps how many run at once.
//! Outcomes are broadcast so callers can wait for a specific repair.
//!
//! Shutting down closes the queue. The worker still drains every event that
//! was accepted before it, then waits for running repairs and exits.

use super::edge_delete::EdgeDeleteRepair;
use super::node_delete::NodeDeleteRepair;
use crate::graph::{GraphConfig, GraphError, GraphResult, Id, MarkedEdge, Scope};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Work handed to the pipeline after a delete commits
#[derive(Debug, Clone)]
pub enum RepairEvent {
    EdgeDeleted {
        scope: Scope,
        /// The tombstone that was written
        edge: MarkedEdge,
        timestamp: i64,
    },
    NodeDeleted {
        scope: Scope,
        node: Id,
        timestamp: i64,
    },
}

#[derive(Debug, Clone)]
pub enum RepairOutcome {
    EdgeRepaired { edge: MarkedEdge, removed: usize },
    NodeRepaired { node: Id, edges: usize },
    Failed { event: RepairEvent, error: String },
}

pub struct RepairPipeline {
    sender: Mutex<Option<UnboundedSender<RepairEvent>>>,
    outcomes: broadcast::Sender<RepairOutcome>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RepairPipeline {
    /// Spawn the worker loop on the current tokio runtime
    pub fn start(
        edge_delete: EdgeDeleteRepair,
        node_delete: NodeDeleteRepair,
        config: &GraphConfig,
    ) -> GraphResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            GraphError::Config(format!("repair pipeline needs a tokio runtime: {}", e))
        })?;

        let (sender, receiver) = unbounded_channel();
        let (outcomes, _) = broadcast::channel(config.repair_buffer_size.max(1));
        let concurrency = config.repair_concurrent_size.max(1);

        let worker = runtime.spawn(Self::run(
            receiver,
            edge_delete,
            node_delete,
            concurrency,
            outcomes.clone(),
        ));
        info!("Repair pipeline started with {} concurrent tasks", concurrency);

        Ok(RepairPipeline {
            sender: Mutex::new(Some(sender)),
            outcomes,
            worker: Mutex::new(Some(worker)),
        })
    }

    async fn run(
        mut receiver: UnboundedReceiver<RepairEvent>,
        edge_delete: EdgeDeleteRepair,
        node_delete: NodeDeleteRepair,
        concurrency: usize,
        outcomes: broadcast::Sender<RepairOutcome>,
    ) {
        let permits = Arc::new(Semaphore::new(concurrency));
        while let Some(event) = receiver.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let edge_delete = edge_delete.clone();
            let node_delete = node_delete.clone();
            let outcomes = outcomes.clone();

            tokio::spawn(async move {
                let outcome = Self::process(&edge_delete, &node_delete, event).await;
                drop(edge_delete);
                drop(node_delete);
                // No subscribers is fine
                let _ = outcomes.send(outcome);
                drop(permit);
            });
        }
        // Holding every permit means no repair is still running
        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        if permits.acquire_many(all).await.is_err() {
            warn!("Repair permits closed before running repairs finished");
        }
        debug!("Repair worker loop exited");
    }

    async fn process(
        edge_delete: &EdgeDeleteRepair,
        node_delete: &NodeDeleteRepair,
        event: RepairEvent,
    ) -> RepairOutcome {
        let result = match &event {
            RepairEvent::EdgeDeleted { scope, edge, .. } => edge_delete
                .repair(scope, edge)
                .await
                .map(|removed| RepairOutcome::EdgeRepaired {
                    edge: edge.clone(),
                    removed,
                }),
            RepairEvent::NodeDeleted {
                scope,
                node,
                timestamp,
            } => node_delete
                .receive(scope, node, *timestamp)
                .await
                .map(|edges| RepairOutcome::NodeRepaired {
                    node: node.clone(),
                    edges,
                }),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Repair of {:?} failed: {}", event, e);
                RepairOutcome::Failed {
                    event,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Queue `event`. Fails once the pipeline has been shut down.
    pub fn dispatch(&self, event: RepairEvent) -> GraphResult<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender
                .send(event)
                .map_err(|_| GraphError::RepairUnavailable("worker loop has exited".to_string())),
            None => Err(GraphError::RepairUnavailable(
                "pipeline is shut down".to_string(),
            )),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepairOutcome> {
        self.outcomes.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting events. Events queued before the call are still
    /// repaired; [`RepairPipeline::drained`] waits for them.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            info!("Repair pipeline shut down, draining queued repairs");
        }
    }

    /// Wait until the worker has exited and every repair it started has
    /// finished. Only returns after [`RepairPipeline::shutdown`].
    pub async fn drained(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Repair worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RepairPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, TypeSearch};
    use crate::repair::fixture::Fixture;
    use crate::repair::EdgeMetaRepair;
    use crate::persistence::ColumnStore;
    use futures::TryStreamExt;

    fn pipeline(f: &Fixture) -> RepairPipeline {
        let edge_delete = EdgeDeleteRepair::new(f.store.clone(), f.edges.clone(), f.metadata.clone());
        let meta = EdgeMetaRepair::new(f.store.clone(), f.edges.clone(), f.metadata.clone(), 2);
        let node_delete = NodeDeleteRepair::new(
            f.store.clone(),
            f.edges.clone(),
            f.metadata.clone(),
            f.nodes.clone(),
            edge_delete.clone(),
            meta,
            f.config.clone(),
        );
        RepairPipeline::start(edge_delete, node_delete, &f.config).unwrap()
    }

    #[test]
    fn test_start_requires_runtime() {
        let f = Fixture::new();
        let edge_delete = EdgeDeleteRepair::new(f.store.clone(), f.edges.clone(), f.metadata.clone());
        let meta = EdgeMetaRepair::new(f.store.clone(), f.edges.clone(), f.metadata.clone(), 2);
        let node_delete = NodeDeleteRepair::new(
            f.store.clone(),
            f.edges.clone(),
            f.metadata.clone(),
            f.nodes.clone(),
            edge_delete.clone(),
            meta,
            f.config.clone(),
        );
        let result = RepairPipeline::start(edge_delete, node_delete, &f.config);
        assert!(matches!(result, Err(GraphError::Config(_))));
    }

    #[tokio::test]
    async fn test_edge_delete_event_is_repaired() {
        let f = Fixture::new();
        let a = Id::generate("user");
        let edge = Edge::new(a.clone(), "likes", Id::generate("post"), 100);
        f.write(&edge).await;
        let tombstone = f.tombstone(&edge).await;

        let pipeline = pipeline(&f);
        let mut outcomes = pipeline.subscribe();
        pipeline
            .dispatch(RepairEvent::EdgeDeleted {
                scope: f.scope.clone(),
                edge: tombstone.clone(),
                timestamp: 10_000,
            })
            .unwrap();

        match outcomes.recv().await.unwrap() {
            RepairOutcome::EdgeRepaired { edge, removed } => {
                assert_eq!(edge, tombstone);
                assert_eq!(removed, 4);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let types: Vec<String> = f
            .metadata
            .get_edge_types_from_source(&f.scope, &TypeSearch::edge_types(a))
            .try_collect()
            .await
            .unwrap();
        assert!(types.is_empty());
    }

    #[tokio::test]
    async fn test_node_delete_event_is_repaired() {
        let f = Fixture::new();
        let a = Id::generate("user");
        f.write(&Edge::new(a.clone(), "likes", Id::generate("post"), 100)).await;
        f.store.execute(f.nodes.mark(&f.scope, &a, 200)).await.unwrap();

        let pipeline = pipeline(&f);
        let mut outcomes = pipeline.subscribe();
        pipeline
            .dispatch(RepairEvent::NodeDeleted {
                scope: f.scope.clone(),
                node: a.clone(),
                timestamp: 10_000,
            })
            .unwrap();

        match outcomes.recv().await.unwrap() {
            RepairOutcome::NodeRepaired { node, edges } => {
                assert_eq!(node, a);
                assert_eq!(edges, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let f = Fixture::new();
        let edge = Edge::new(Id::generate("user"), "likes", Id::generate("post"), 100);
        f.write(&edge).await;
        let tombstone = f.tombstone(&edge).await;

        let pipeline = pipeline(&f);
        let mut outcomes = pipeline.subscribe();
        f.store.set_unavailable(true);
        pipeline
            .dispatch(RepairEvent::EdgeDeleted {
                scope: f.scope.clone(),
                edge: tombstone,
                timestamp: 10_000,
            })
            .unwrap();

        assert!(matches!(
            outcomes.recv().await.unwrap(),
            RepairOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let f = Fixture::new();
        let pipeline = pipeline(&f);
        pipeline.shutdown();
        assert!(pipeline.is_closed());

        let result = pipeline.dispatch(RepairEvent::NodeDeleted {
            scope: f.scope.clone(),
            node: Id::generate("user"),
            timestamp: 10_000,
        });
        assert!(matches!(result, Err(GraphError::RepairUnavailable(_))));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_events() {
        let f = Fixture::new();
        let a = Id::generate("user");
        let b = Id::generate("user");
        let mut tombstones = Vec::new();
        for source in [&a, &b] {
            let edge = Edge::new(source.clone(), "likes", Id::generate("post"), 100);
            f.write(&edge).await;
            tombstones.push(f.tombstone(&edge).await);
        }

        let pipeline = pipeline(&f);
        for tombstone in tombstones {
            pipeline
                .dispatch(RepairEvent::EdgeDeleted {
                    scope: f.scope.clone(),
                    edge: tombstone,
                    timestamp: 10_000,
                })
                .unwrap();
        }
        pipeline.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), pipeline.drained())
            .await
            .unwrap();

        for node in [a, b] {
            let types: Vec<String> = f
                .metadata
                .get_edge_types_from_source(&f.scope, &TypeSearch::edge_types(node))
                .try_collect()
                .await
                .unwrap();
            assert!(types.is_empty());
        }
    }
}
