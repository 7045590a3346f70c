//! Edge value types
//!
//! An [`Edge`] is an immutable, timestamped, typed link between two ids.
//! A [`MarkedEdge`] adds the deleted flag stored with every edge row; a
//! deleted marked edge is a tombstone and never a physical removal.

use super::error::{GraphError, GraphResult};
use super::types::Id;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// A directed, typed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node (edge goes FROM this node)
    pub source: Id,

    /// Relationship type, e.g. "likes"
    pub edge_type: String,

    /// Target node (edge goes TO this node)
    pub target: Id,

    /// Logical write time, unrelated to the tokens inside the ids
    pub timestamp: i64,
}

impl Edge {
    pub fn new(source: Id, edge_type: impl Into<String>, target: Id, timestamp: i64) -> Self {
        Edge {
            source,
            edge_type: edge_type.into(),
            target,
            timestamp,
        }
    }

    /// Identity shared by every version of this edge
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source.clone(),
            edge_type: self.edge_type.clone(),
            target: self.target.clone(),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({})-[{}@{}]->({})",
            self.source, self.edge_type, self.timestamp, self.target
        )
    }
}

/// (source, type, target): the logical edge, independent of version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub source: Id,
    pub edge_type: String,
    pub target: Id,
}

/// An edge version together with its deleted flag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkedEdge {
    edge: Edge,
    deleted: bool,
}

impl MarkedEdge {
    pub fn new(edge: Edge, deleted: bool) -> Self {
        MarkedEdge { edge, deleted }
    }

    /// Build the tombstone that hides `edge` and every older version of it.
    ///
    /// The tombstone sits one tick above the version it deletes so readers
    /// asking for `edge.timestamp` still see the edge.
    pub fn tombstone_for(edge: &Edge) -> GraphResult<Self> {
        let timestamp = edge.timestamp.checked_add(1).ok_or_else(|| {
            GraphError::Validation(format!("edge {} has no room for a tombstone", edge))
        })?;

        Ok(MarkedEdge {
            edge: Edge {
                timestamp,
                ..edge.clone()
            },
            deleted: true,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn as_edge(&self) -> &Edge {
        &self.edge
    }

    pub fn into_edge(self) -> Edge {
        self.edge
    }
}

impl Deref for MarkedEdge {
    type Target = Edge;

    fn deref(&self) -> &Edge {
        &self.edge
    }
}

impl fmt::Display for MarkedEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deleted {
            write!(f, "{} (deleted)", self.edge)
        } else {
            write!(f, "{}", self.edge)
        }
    }
}
