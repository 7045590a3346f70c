//! Asynchronous consistency repair
//!
//! Deletes are synchronous only up to the tombstone or node mark. Everything
//! after that runs here, off the caller's path:
//! - edge-delete repair drops type metadata nobody else needs
//! - edge meta repair re-derives a node's type registrations from its edges
//! - node-delete repair cascades a node mark over every edge of the node
//!
//! Every step is idempotent, so an interrupted repair is resumed by simply
//! dispatching it again.

pub mod edge_delete;
pub mod meta;
pub mod node_delete;
pub mod processor;

pub use edge_delete::EdgeDeleteRepair;
pub use meta::EdgeMetaRepair;
pub use node_delete::NodeDeleteRepair;
pub use processor::{RepairEvent, RepairOutcome, RepairPipeline};

use crate::graph::{EdgeKey, EdgeSearch, GraphResult, Scope};
use crate::serialization::EdgeSerialization;
use rustc_hash::{FxHashMap, FxHashSet};

/// Count distinct live logical edges of `search`, stopping at `limit`.
///
/// Tombstones hide older versions of their edge. Node marks are not
/// consulted: an edge of a deleted node counts until its cascade removes it.
pub(crate) async fn count_live_edges(
    edges: &dyn EdgeSerialization,
    scope: &Scope,
    search: &EdgeSearch,
    limit: usize,
) -> GraphResult<usize> {
    let mut pages = edges.get_edges(scope, search).await?;
    let mut tombstones: FxHashMap<EdgeKey, i64> = FxHashMap::default();
    let mut live: FxHashSet<EdgeKey> = FxHashSet::default();

    while let Some(page) = pages.next_page().await {
        for edge in page? {
            let key = edge.key();
            if edge.is_deleted() {
                let slot = tombstones.entry(key).or_insert(edge.timestamp);
                *slot = (*slot).max(edge.timestamp);
                continue;
            }
            if tombstones.get(&key).is_some_and(|ts| *ts > edge.timestamp) {
                continue;
            }
            live.insert(key);
            if live.len() >= limit {
                return Ok(live.len());
            }
        }
    }
    Ok(live.len())
}
