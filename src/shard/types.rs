//! Shard and bucket value types

use crate::graph::{Edge, Id, MarkedEdge, Scope};
use crate::persistence::{
    encode_i64, Column, ColumnFamily, KeyBuilder, KeyReader, MutationBatch, StorageError,
    StorageResult,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// One physical partition of a bucket's adjacency list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    shard_index: i64,
    created_time: i64,
    compacted: bool,
}

impl Shard {
    pub fn new(shard_index: i64, created_time: i64, compacted: bool) -> Self {
        Shard {
            shard_index,
            created_time,
            compacted,
        }
    }

    /// The shard every bucket starts with. It covers all time from zero.
    pub fn root() -> Self {
        Shard::new(0, 0, true)
    }

    pub fn shard_index(&self) -> i64 {
        self.shard_index
    }

    pub fn created_time(&self) -> i64 {
        self.created_time
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted
    }
}

impl Ord for Shard {
    fn cmp(&self, other: &Self) -> Ordering {
        self.shard_index
            .cmp(&other.shard_index)
            .then(self.created_time.cmp(&other.created_time))
            .then(self.compacted.cmp(&other.compacted))
    }
}

impl PartialOrd for Shard {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Shard(index={}, created={}, compacted={})",
            self.shard_index, self.created_time, self.compacted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    FromSource,
    ToTarget,
}

/// A bucket: (node, edge type, direction, optional peer id type).
///
/// Shards, counters and metadata are all tracked per bucket. The bucket
/// also knows how its edges are laid out: which column family holds them,
/// how a shard row is keyed and how a column maps back to an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectedEdgeMeta {
    pub node: Id,
    pub edge_type: String,
    pub direction: Direction,
    pub peer_id_type: Option<String>,
}

const DELETED: u8 = 1;
const LIVE: u8 = 0;

/// Value stored in every edge column
pub fn edge_value(deleted: bool) -> Vec<u8> {
    vec![if deleted { DELETED } else { LIVE }]
}

pub fn is_deleted_value(value: &[u8]) -> StorageResult<bool> {
    match value.first() {
        Some(&DELETED) => Ok(true),
        Some(&LIVE) => Ok(false),
        other => Err(StorageError::Corrupt(format!("invalid edge flag {:?}", other))),
    }
}

impl DirectedEdgeMeta {
    pub fn from_source(node: Id, edge_type: impl Into<String>) -> Self {
        DirectedEdgeMeta {
            node,
            edge_type: edge_type.into(),
            direction: Direction::FromSource,
            peer_id_type: None,
        }
    }

    pub fn from_source_with_target_type(
        node: Id,
        edge_type: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        DirectedEdgeMeta {
            peer_id_type: Some(target_type.into()),
            ..Self::from_source(node, edge_type)
        }
    }

    pub fn to_target(node: Id, edge_type: impl Into<String>) -> Self {
        DirectedEdgeMeta {
            node,
            edge_type: edge_type.into(),
            direction: Direction::ToTarget,
            peer_id_type: None,
        }
    }

    pub fn to_target_with_source_type(
        node: Id,
        edge_type: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        DirectedEdgeMeta {
            peer_id_type: Some(source_type.into()),
            ..Self::to_target(node, edge_type)
        }
    }

    /// The four buckets every edge is written to
    pub fn for_edge(edge: &Edge) -> [DirectedEdgeMeta; 4] {
        [
            Self::from_source(edge.source.clone(), &edge.edge_type),
            Self::from_source_with_target_type(
                edge.source.clone(),
                &edge.edge_type,
                edge.target.id_type(),
            ),
            Self::to_target(edge.target.clone(), &edge.edge_type),
            Self::to_target_with_source_type(
                edge.target.clone(),
                &edge.edge_type,
                edge.source.id_type(),
            ),
        ]
    }

    pub fn column_family(&self) -> ColumnFamily {
        match (self.direction, self.peer_id_type.is_some()) {
            (Direction::FromSource, false) => ColumnFamily::EdgesFromSource,
            (Direction::FromSource, true) => ColumnFamily::EdgesFromSourceByTargetType,
            (Direction::ToTarget, false) => ColumnFamily::EdgesToTarget,
            (Direction::ToTarget, true) => ColumnFamily::EdgesToTargetBySourceType,
        }
    }

    /// Row key shared by the bucket's shard metadata and counters
    pub fn bucket_key(&self, scope: &Scope) -> Vec<u8> {
        let builder = KeyBuilder::new()
            .scope(scope)
            .id(&self.node)
            .string(&self.edge_type)
            .u8(match self.direction {
                Direction::FromSource => 0,
                Direction::ToTarget => 1,
            });
        match &self.peer_id_type {
            Some(peer) => builder.u8(1).string(peer).build(),
            None => builder.u8(0).build(),
        }
    }

    /// Row holding this bucket's edges inside one shard
    pub fn row_key(&self, scope: &Scope, shard: &Shard) -> Vec<u8> {
        let mut key = self.bucket_key(scope);
        key.extend_from_slice(&encode_i64(shard.shard_index()));
        key
    }

    fn peer<'a>(&self, edge: &'a Edge) -> &'a Id {
        match self.direction {
            Direction::FromSource => &edge.target,
            Direction::ToTarget => &edge.source,
        }
    }

    /// Columns sort by (timestamp, peer id)
    pub fn column_name(&self, edge: &Edge) -> Vec<u8> {
        KeyBuilder::new().i64(edge.timestamp).id(self.peer(edge)).build()
    }

    pub fn decode(&self, column: &Column) -> StorageResult<MarkedEdge> {
        let mut reader = KeyReader::new(&column.name);
        let timestamp = reader.i64()?;
        let peer = reader.id()?;
        let (source, target) = match self.direction {
            Direction::FromSource => (self.node.clone(), peer),
            Direction::ToTarget => (peer, self.node.clone()),
        };
        Ok(MarkedEdge::new(
            Edge::new(source, &self.edge_type, target, timestamp),
            is_deleted_value(&column.value)?,
        ))
    }

    /// Does `edge` live in this bucket?
    pub fn contains(&self, edge: &Edge) -> bool {
        let node = match self.direction {
            Direction::FromSource => &edge.source,
            Direction::ToTarget => &edge.target,
        };
        node == &self.node
            && edge.edge_type == self.edge_type
            && self
                .peer_id_type
                .as_deref()
                .map_or(true, |t| self.peer(edge).id_type() == t)
    }

    pub fn write_edge(
        &self,
        batch: &mut MutationBatch,
        scope: &Scope,
        shard: &Shard,
        edge: &MarkedEdge,
        timestamp: i64,
    ) {
        batch.put(
            self.column_family(),
            self.row_key(scope, shard),
            self.column_name(edge),
            edge_value(edge.is_deleted()),
            timestamp,
        );
    }

    pub fn delete_edge(
        &self,
        batch: &mut MutationBatch,
        scope: &Scope,
        shard: &Shard,
        edge: &Edge,
        timestamp: i64,
    ) {
        batch.delete(
            self.column_family(),
            self.row_key(scope, shard),
            self.column_name(edge),
            timestamp,
        );
    }
}

impl fmt::Display for DirectedEdgeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::FromSource => "from",
            Direction::ToTarget => "to",
        };
        write!(f, "{} {} [{}]", direction, self.node, self.edge_type)?;
        if let Some(peer) = &self.peer_id_type {
            write!(f, " peer type {}", peer)?;
        }
        Ok(())
    }
}
