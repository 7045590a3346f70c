//! Read-side visibility rules shared by every edge scan
//!
//! An edge version is returned only when all of these hold:
//! - it is not a tombstone and is at or below the search cutoff
//! - no tombstone of the same logical edge sits above it
//! - neither endpoint has a node mark at or above its timestamp
//!
//! Tombstones sort above the versions they hide, so a scan from the top sees
//! them first. A scan resumed from a cursor may have skipped them; for each
//! logical edge it meets, it probes the version row between the cursor and
//! the cutoff once.

use super::edge::{Edge, EdgeKey, MarkedEdge};
use super::error::{GraphError, GraphResult};
use super::search::EdgeSearch;
use super::types::{Id, Scope};
use crate::serialization::{EdgePages, EdgeSerialization, NodeSerialization};
use futures::future::try_join_all;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

#[derive(Clone)]
pub struct VisibilityFilter {
    edges: Arc<dyn EdgeSerialization>,
    nodes: NodeSerialization,
}

struct FilterState {
    filter: VisibilityFilter,
    scope: Scope,
    search: EdgeSearch,
    pages: EdgePages,
    /// Highest tombstone seen per logical edge
    tombstones: FxHashMap<EdgeKey, i64>,
    probed: FxHashSet<EdgeKey>,
}

impl FilterState {
    fn hidden_by_tombstone(&self, edge: &Edge) -> bool {
        self.tombstones
            .get(&edge.key())
            .is_some_and(|tombstone| *tombstone > edge.timestamp)
    }

    async fn apply(&mut self, page: Vec<MarkedEdge>) -> GraphResult<Vec<Edge>> {
        let max = self.search.max_timestamp;
        let mut candidates = Vec::with_capacity(page.len());
        for marked in page {
            if marked.timestamp > max {
                continue;
            }
            if marked.is_deleted() {
                let slot = self.tombstones.entry(marked.key()).or_insert(marked.timestamp);
                *slot = (*slot).max(marked.timestamp);
                continue;
            }
            if !self.hidden_by_tombstone(&marked) {
                candidates.push(marked.into_edge());
            }
        }

        if let Some(cursor) = &self.search.last {
            let floor = cursor.timestamp;
            let unprobed: Vec<EdgeKey> = candidates
                .iter()
                .map(Edge::key)
                .filter(|key| self.probed.insert(key.clone()))
                .collect();
            let found = try_join_all(
                unprobed
                    .iter()
                    .map(|key| self.filter.probe_tombstone(&self.scope, key, floor, max)),
            )
            .await?;
            for (key, tombstone) in unprobed.into_iter().zip(found) {
                if let Some(ts) = tombstone {
                    let slot = self.tombstones.entry(key).or_insert(ts);
                    *slot = (*slot).max(ts);
                }
            }
            candidates.retain(|edge| !self.hidden_by_tombstone(edge));
        }

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<Id> = candidates
            .iter()
            .flat_map(|edge| [edge.source.clone(), edge.target.clone()])
            .collect::<FxHashSet<Id>>()
            .into_iter()
            .collect();
        let marks = self.filter.nodes.get_max_versions(&self.scope, &ids).await?;
        let marked_at = |id: &Id, ts: i64| marks.get(id).is_some_and(|mark| *mark >= ts);
        candidates.retain(|edge| {
            !marked_at(&edge.source, edge.timestamp) && !marked_at(&edge.target, edge.timestamp)
        });
        Ok(candidates)
    }
}

impl VisibilityFilter {
    pub fn new(edges: Arc<dyn EdgeSerialization>, nodes: NodeSerialization) -> Self {
        VisibilityFilter { edges, nodes }
    }

    /// Highest tombstone of `key` in `[floor, max]`
    async fn probe_tombstone(
        &self,
        scope: &Scope,
        key: &EdgeKey,
        floor: i64,
        max: i64,
    ) -> GraphResult<Option<i64>> {
        let search = EdgeSearch::versions(
            key.source.clone(),
            key.edge_type.clone(),
            key.target.clone(),
        )
        .max_timestamp(max);
        let mut pages = self.edges.get_edges(scope, &search).await?;
        while let Some(page) = pages.next_page().await {
            for version in page? {
                if version.timestamp < floor {
                    return Ok(None);
                }
                if version.is_deleted() {
                    return Ok(Some(version.timestamp));
                }
            }
        }
        Ok(None)
    }

    /// Stream the visible edges of `search`, newest first
    pub async fn load(
        &self,
        scope: &Scope,
        search: EdgeSearch,
    ) -> GraphResult<BoxStream<'static, GraphResult<Edge>>> {
        let pages = self.edges.get_edges(scope, &search).await?;
        let state = FilterState {
            filter: self.clone(),
            scope: scope.clone(),
            search,
            pages,
            tombstones: FxHashMap::default(),
            probed: FxHashSet::default(),
        };

        Ok(stream::try_unfold(state, |mut state| async move {
            let Some(page) = state.pages.next_page().await else {
                return Ok::<_, GraphError>(None);
            };
            let visible = state.apply(page?).await?;
            Ok(Some((visible, state)))
        })
        .map_ok(|visible| stream::iter(visible.into_iter().map(Ok)))
        .try_flatten()
        .boxed())
    }
}
