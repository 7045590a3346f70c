//! Storage port: a wide-column store addressed by (column family, row, column)
//!
//! Every cell carries a write timestamp with last-write-wins semantics:
//! - a put replaces a cell only when its timestamp is >= the stored one
//! - a delete removes a cell only when the cell's timestamp is <= the delete's
//! - counter increments are atomic per cell and ignore timestamps
//!
//! Mutations are collected into a [`MutationBatch`] and applied all-or-nothing
//! by [`ColumnStore::execute`].

use async_trait::async_trait;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB error
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Column family error
    #[error("Column family error: {0}")]
    ColumnFamily(String),

    /// A key or value that could not be decoded
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// The store cannot be reached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Logical column families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnFamily {
    EdgesFromSource,
    EdgesFromSourceByTargetType,
    EdgesToTarget,
    EdgesToTargetBySourceType,
    EdgeVersions,
    EdgeTypesFromSource,
    EdgeTypesToTarget,
    IdTypesFromSource,
    IdTypesToTarget,
    NodeMarks,
    ShardMeta,
    ShardCounts,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 12] = [
        ColumnFamily::EdgesFromSource,
        ColumnFamily::EdgesFromSourceByTargetType,
        ColumnFamily::EdgesToTarget,
        ColumnFamily::EdgesToTargetBySourceType,
        ColumnFamily::EdgeVersions,
        ColumnFamily::EdgeTypesFromSource,
        ColumnFamily::EdgeTypesToTarget,
        ColumnFamily::IdTypesFromSource,
        ColumnFamily::IdTypesToTarget,
        ColumnFamily::NodeMarks,
        ColumnFamily::ShardMeta,
        ColumnFamily::ShardCounts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::EdgesFromSource => "graph_edges_from_source",
            ColumnFamily::EdgesFromSourceByTargetType => "graph_edges_from_source_by_target_type",
            ColumnFamily::EdgesToTarget => "graph_edges_to_target",
            ColumnFamily::EdgesToTargetBySourceType => "graph_edges_to_target_by_source_type",
            ColumnFamily::EdgeVersions => "graph_edge_versions",
            ColumnFamily::EdgeTypesFromSource => "graph_edge_types_from_source",
            ColumnFamily::EdgeTypesToTarget => "graph_edge_types_to_target",
            ColumnFamily::IdTypesFromSource => "graph_id_types_from_source",
            ColumnFamily::IdTypesToTarget => "graph_id_types_to_target",
            ColumnFamily::NodeMarks => "graph_node_marks",
            ColumnFamily::ShardMeta => "graph_shard_meta",
            ColumnFamily::ShardCounts => "graph_shard_counts",
        }
    }
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One cell as returned by a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put {
        cf: ColumnFamily,
        row: Vec<u8>,
        column: Vec<u8>,
        value: Vec<u8>,
        timestamp: i64,
    },
    Delete {
        cf: ColumnFamily,
        row: Vec<u8>,
        column: Vec<u8>,
        timestamp: i64,
    },
    /// Remove every cell of the row written at or before `timestamp`
    DeleteRow {
        cf: ColumnFamily,
        row: Vec<u8>,
        timestamp: i64,
    },
    Increment {
        cf: ColumnFamily,
        row: Vec<u8>,
        column: Vec<u8>,
        delta: i64,
    },
}

/// Deferred row-level writes. Nothing happens until the batch is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBatch {
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        cf: ColumnFamily,
        row: Vec<u8>,
        column: Vec<u8>,
        value: Vec<u8>,
        timestamp: i64,
    ) -> &mut Self {
        self.mutations.push(Mutation::Put {
            cf,
            row,
            column,
            value,
            timestamp,
        });
        self
    }

    pub fn delete(
        &mut self,
        cf: ColumnFamily,
        row: Vec<u8>,
        column: Vec<u8>,
        timestamp: i64,
    ) -> &mut Self {
        self.mutations.push(Mutation::Delete {
            cf,
            row,
            column,
            timestamp,
        });
        self
    }

    pub fn delete_row(&mut self, cf: ColumnFamily, row: Vec<u8>, timestamp: i64) -> &mut Self {
        self.mutations.push(Mutation::DeleteRow { cf, row, timestamp });
        self
    }

    pub fn increment(
        &mut self,
        cf: ColumnFamily,
        row: Vec<u8>,
        column: Vec<u8>,
        delta: i64,
    ) -> &mut Self {
        self.mutations.push(Mutation::Increment {
            cf,
            row,
            column,
            delta,
        });
        self
    }

    /// Append `other` so both execute as one physical write
    pub fn merge(&mut self, other: MutationBatch) -> &mut Self {
        self.mutations.extend(other.mutations);
        self
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Timestamp rule for puts
pub fn put_wins(existing: Option<i64>, incoming: i64) -> bool {
    existing.map_or(true, |current| incoming >= current)
}

/// Timestamp rule for deletes
pub fn delete_wins(existing: i64, delete_timestamp: i64) -> bool {
    existing <= delete_timestamp
}

pub fn encode_counter(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn decode_counter(bytes: &[u8]) -> StorageResult<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("counter cell has {} bytes", bytes.len())))?;
    Ok(i64::from_be_bytes(raw))
}

/// Bounds, direction and size of one column scan within a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub reversed: bool,
    pub limit: usize,
}

impl ColumnRange {
    pub fn all() -> Self {
        ColumnRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            reversed: false,
            limit: usize::MAX,
        }
    }

    pub fn between(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        ColumnRange {
            start,
            end,
            ..Self::all()
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// True when no column can satisfy both bounds
    pub fn is_empty(&self) -> bool {
        if self.limit == 0 {
            return true;
        }
        let (start, start_inclusive) = match &self.start {
            Bound::Included(s) => (s, true),
            Bound::Excluded(s) => (s, false),
            Bound::Unbounded => return false,
        };
        let (end, end_inclusive) = match &self.end {
            Bound::Included(e) => (e, true),
            Bound::Excluded(e) => (e, false),
            Bound::Unbounded => return false,
        };
        match start.cmp(end) {
            Ordering::Greater => true,
            Ordering::Equal => !(start_inclusive && end_inclusive),
            Ordering::Less => false,
        }
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        let above_start = match &self.start {
            Bound::Included(s) => name >= s.as_slice(),
            Bound::Excluded(s) => name > s.as_slice(),
            Bound::Unbounded => true,
        };
        let below_end = match &self.end {
            Bound::Included(e) => name <= e.as_slice(),
            Bound::Excluded(e) => name < e.as_slice(),
            Bound::Unbounded => true,
        };
        above_start && below_end
    }
}

/// Async client for the backing wide-column store
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Apply every mutation of the batch, or none of them
    async fn execute(&self, batch: MutationBatch) -> StorageResult<()>;

    /// Columns of one row within `range`, ascending unless `range.reversed`
    async fn scan(
        &self,
        cf: ColumnFamily,
        row: &[u8],
        range: &ColumnRange,
    ) -> StorageResult<Vec<Column>>;

    async fn get(&self, cf: ColumnFamily, row: &[u8], column: &[u8])
        -> StorageResult<Option<Column>>;

    /// The greatest column of each row, in one round trip
    async fn last_columns(
        &self,
        cf: ColumnFamily,
        rows: &[Vec<u8>],
    ) -> StorageResult<Vec<Option<Column>>>;

    /// Current value of a counter cell; missing counters read as zero
    async fn counter(&self, cf: ColumnFamily, row: &[u8], column: &[u8]) -> StorageResult<i64> {
        match self.get(cf, row, column).await? {
            Some(cell) => decode_counter(&cell.value),
            None => Ok(0),
        }
    }
}
