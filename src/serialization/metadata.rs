//! Edge type and id type registry
//!
//! Records which edge types a node has in each direction, and which peer id
//! types appear under each (node, edge type). Column names are the raw type
//! strings, so listings come back sorted and prefix scans are contiguous.
//!
//! Cells carry the newest logical edge timestamp registered under them. A
//! removal at a lower timestamp leaves the cell in place, so repairs read the
//! cell's timestamp before probing and remove at that timestamp.

use crate::graph::{Edge, GraphError, GraphResult, Id, Scope, TypeSearch};
use crate::persistence::{
    ColumnFamily, ColumnRange, ColumnStore, KeyBuilder, MutationBatch, StorageError,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

#[derive(Clone)]
pub struct EdgeMetadataSerialization {
    store: Arc<dyn ColumnStore>,
    page_size: usize,
}

fn node_row(scope: &Scope, node: &Id) -> Vec<u8> {
    KeyBuilder::new().scope(scope).id(node).build()
}

fn type_row(scope: &Scope, node: &Id, edge_type: &str) -> Vec<u8> {
    KeyBuilder::new().scope(scope).id(node).string(edge_type).build()
}

/// Paged ascending listing of one registry row
struct TypeListing {
    store: Arc<dyn ColumnStore>,
    cf: ColumnFamily,
    row: Vec<u8>,
    start: Bound<Vec<u8>>,
    prefix: Vec<u8>,
    page_size: usize,
    buffer: VecDeque<String>,
    exhausted: bool,
}

impl TypeListing {
    async fn fetch(&mut self) -> GraphResult<()> {
        let range = ColumnRange::between(self.start.clone(), Bound::Unbounded).limit(self.page_size);
        let page = self.store.scan(self.cf, &self.row, &range).await?;
        self.exhausted = page.len() < self.page_size;

        for column in page {
            if !column.name.starts_with(&self.prefix) {
                self.exhausted = true;
                break;
            }
            let name = String::from_utf8(column.name.clone())
                .map_err(|e| StorageError::Corrupt(format!("type name: {}", e)))?;
            self.start = Bound::Excluded(column.name);
            self.buffer.push_back(name);
        }
        Ok(())
    }

    fn into_stream(self) -> BoxStream<'static, GraphResult<String>> {
        stream::try_unfold(self, |mut listing| async move {
            loop {
                if let Some(name) = listing.buffer.pop_front() {
                    return Ok::<_, GraphError>(Some((name, listing)));
                }
                if listing.exhausted {
                    return Ok(None);
                }
                listing.fetch().await?;
            }
        })
        .boxed()
    }
}

impl EdgeMetadataSerialization {
    pub fn new(store: Arc<dyn ColumnStore>, page_size: usize) -> Self {
        EdgeMetadataSerialization {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Register every type `edge` contributes, in both directions
    pub fn write_edge(&self, scope: &Scope, edge: &Edge) -> MutationBatch {
        let mut batch = MutationBatch::new();
        let ts = edge.timestamp;
        batch
            .put(
                ColumnFamily::EdgeTypesFromSource,
                node_row(scope, &edge.source),
                edge.edge_type.as_bytes().to_vec(),
                Vec::new(),
                ts,
            )
            .put(
                ColumnFamily::EdgeTypesToTarget,
                node_row(scope, &edge.target),
                edge.edge_type.as_bytes().to_vec(),
                Vec::new(),
                ts,
            )
            .put(
                ColumnFamily::IdTypesFromSource,
                type_row(scope, &edge.source, &edge.edge_type),
                edge.target.id_type().as_bytes().to_vec(),
                Vec::new(),
                ts,
            )
            .put(
                ColumnFamily::IdTypesToTarget,
                type_row(scope, &edge.target, &edge.edge_type),
                edge.source.id_type().as_bytes().to_vec(),
                Vec::new(),
                ts,
            );
        batch
    }

    async fn registered_at(
        &self,
        cf: ColumnFamily,
        row: Vec<u8>,
        column: &str,
    ) -> GraphResult<Option<i64>> {
        let cell = self.store.get(cf, &row, column.as_bytes()).await?;
        Ok(cell.map(|c| c.timestamp))
    }

    /// Timestamp of the registration of `edge_type` leaving `source`, if any.
    ///
    /// A removal must be issued at or above it to take effect.
    pub async fn edge_type_from_source_at(
        &self,
        scope: &Scope,
        source: &Id,
        edge_type: &str,
    ) -> GraphResult<Option<i64>> {
        self.registered_at(ColumnFamily::EdgeTypesFromSource, node_row(scope, source), edge_type)
            .await
    }

    pub async fn edge_type_to_target_at(
        &self,
        scope: &Scope,
        target: &Id,
        edge_type: &str,
    ) -> GraphResult<Option<i64>> {
        self.registered_at(ColumnFamily::EdgeTypesToTarget, node_row(scope, target), edge_type)
            .await
    }

    pub async fn id_type_from_source_at(
        &self,
        scope: &Scope,
        source: &Id,
        edge_type: &str,
        target_type: &str,
    ) -> GraphResult<Option<i64>> {
        self.registered_at(
            ColumnFamily::IdTypesFromSource,
            type_row(scope, source, edge_type),
            target_type,
        )
        .await
    }

    pub async fn id_type_to_target_at(
        &self,
        scope: &Scope,
        target: &Id,
        edge_type: &str,
        source_type: &str,
    ) -> GraphResult<Option<i64>> {
        self.registered_at(
            ColumnFamily::IdTypesToTarget,
            type_row(scope, target, edge_type),
            source_type,
        )
        .await
    }

    pub fn remove_edge_type_from_source(
        &self,
        scope: &Scope,
        source: &Id,
        edge_type: &str,
        timestamp: i64,
    ) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.delete(
            ColumnFamily::EdgeTypesFromSource,
            node_row(scope, source),
            edge_type.as_bytes().to_vec(),
            timestamp,
        );
        batch
    }

    pub fn remove_edge_type_to_target(
        &self,
        scope: &Scope,
        target: &Id,
        edge_type: &str,
        timestamp: i64,
    ) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.delete(
            ColumnFamily::EdgeTypesToTarget,
            node_row(scope, target),
            edge_type.as_bytes().to_vec(),
            timestamp,
        );
        batch
    }

    pub fn remove_id_type_from_source(
        &self,
        scope: &Scope,
        source: &Id,
        edge_type: &str,
        target_type: &str,
        timestamp: i64,
    ) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.delete(
            ColumnFamily::IdTypesFromSource,
            type_row(scope, source, edge_type),
            target_type.as_bytes().to_vec(),
            timestamp,
        );
        batch
    }

    pub fn remove_id_type_to_target(
        &self,
        scope: &Scope,
        target: &Id,
        edge_type: &str,
        source_type: &str,
        timestamp: i64,
    ) -> MutationBatch {
        let mut batch = MutationBatch::new();
        batch.delete(
            ColumnFamily::IdTypesToTarget,
            type_row(scope, target, edge_type),
            source_type.as_bytes().to_vec(),
            timestamp,
        );
        batch
    }

    fn listing(&self, cf: ColumnFamily, row: Vec<u8>, search: &TypeSearch) -> TypeListing {
        let prefix = search.prefix.clone().unwrap_or_default().into_bytes();
        let start = match &search.last {
            Some(last) if last.as_bytes() >= prefix.as_slice() => {
                Bound::Excluded(last.as_bytes().to_vec())
            }
            _ => Bound::Included(prefix.clone()),
        };
        TypeListing {
            store: self.store.clone(),
            cf,
            row,
            start,
            prefix,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Edge types leaving `search.node`
    pub fn get_edge_types_from_source(
        &self,
        scope: &Scope,
        search: &TypeSearch,
    ) -> BoxStream<'static, GraphResult<String>> {
        self.listing(
            ColumnFamily::EdgeTypesFromSource,
            node_row(scope, &search.node),
            search,
        )
        .into_stream()
    }

    /// Edge types arriving at `search.node`
    pub fn get_edge_types_to_target(
        &self,
        scope: &Scope,
        search: &TypeSearch,
    ) -> BoxStream<'static, GraphResult<String>> {
        self.listing(
            ColumnFamily::EdgeTypesToTarget,
            node_row(scope, &search.node),
            search,
        )
        .into_stream()
    }

    /// Target id types under (`search.node`, `search.edge_type`).
    /// Empty when the search names no edge type.
    pub fn get_id_types_from_source(
        &self,
        scope: &Scope,
        search: &TypeSearch,
    ) -> BoxStream<'static, GraphResult<String>> {
        match &search.edge_type {
            Some(edge_type) => self
                .listing(
                    ColumnFamily::IdTypesFromSource,
                    type_row(scope, &search.node, edge_type),
                    search,
                )
                .into_stream(),
            None => stream::empty().boxed(),
        }
    }

    /// Source id types under (`search.node`, `search.edge_type`)
    pub fn get_id_types_to_target(
        &self,
        scope: &Scope,
        search: &TypeSearch,
    ) -> BoxStream<'static, GraphResult<String>> {
        match &search.edge_type {
            Some(edge_type) => self
                .listing(
                    ColumnFamily::IdTypesToTarget,
                    type_row(scope, &search.node, edge_type),
                    search,
                )
                .into_stream(),
            None => stream::empty().boxed(),
        }
    }
}
