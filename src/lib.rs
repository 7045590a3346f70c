//! Shardgraph
//!
//! Sharded, versioned edge storage for large graphs on top of a wide-column
//! store.
//!
//! # Architecture
//!
//! - Every (node, edge type, peer id type, direction) bucket is split over
//!   time-indexed shards. Busy buckets get a new shard placed in the future,
//!   so every cache in the fleet moves to it before anyone compacts.
//! - Edges are immutable versions. Deletes write a tombstone one tick above
//!   the deleted version; node deletes write a high-water mark.
//! - Reads hide tombstoned edges and edges of marked nodes.
//! - A background pipeline removes orphaned type metadata and cascades node
//!   deletes over their edges.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use shardgraph::graph::{Edge, GraphConfig, GraphEngine, Id, Scope, SystemTimeService};
//! use shardgraph::metrics::ObservabilityContext;
//! use shardgraph::persistence::MemoryColumnStore;
//! use futures::TryStreamExt;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = GraphEngine::new(
//!     Arc::new(MemoryColumnStore::new()),
//!     GraphConfig::default(),
//!     Arc::new(SystemTimeService),
//!     ObservabilityContext::default(),
//! )?;
//! let graph = engine.graph_manager(Scope::new(Id::generate("application")));
//!
//! let alice = Id::generate("user");
//! let post = Id::generate("post");
//! graph.write_edge(Edge::new(alice.clone(), "likes", post, 100)).await?;
//!
//! let likes: Vec<Edge> = graph
//!     .load_edges_from_source(alice, "likes", i64::MAX)
//!     .await?
//!     .try_collect()
//!     .await?;
//! assert_eq!(likes.len(), 1);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod graph;
pub mod metrics;
pub mod persistence;
pub mod repair;
pub mod serialization;
pub mod shard;

// Re-export main types for convenience
pub use graph::{
    Edge, EdgeKey, EdgeSearch, GraphConfig, GraphEngine, GraphError, GraphManager, GraphResult,
    Id, MarkedEdge, Scope, TypeSearch,
};

pub use persistence::{ColumnStore, MemoryColumnStore, RocksColumnStore, StorageError, StorageResult};

pub use repair::{RepairEvent, RepairOutcome};

pub use metrics::{MetricsSink, ObservabilityContext};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
        assert_eq!(ver, "0.1.0");
    }
}
