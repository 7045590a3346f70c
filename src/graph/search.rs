//! Search descriptors for edge scans and type listings

use super::edge::Edge;
use super::error::{GraphError, GraphResult};
use super::types::Id;
use super::validation::{validate_id, validate_timestamp, validate_type};

/// Which adjacency list an [`EdgeSearch`] walks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchMode {
    /// Edges leaving `node`
    FromSource,
    /// Edges arriving at `node`
    ToTarget,
    /// Edges leaving `node` whose target has the given id type
    FromSourceByTargetType(String),
    /// Edges arriving at `node` whose source has the given id type
    ToTargetBySourceType(String),
    /// Every stored version of the edge `node -> target`
    Versions { target: Id },
}

/// A paginated, point-in-time edge scan.
///
/// Results come back newest first. `last` is the restart cursor: the scan
/// resumes strictly after that edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSearch {
    pub node: Id,
    pub edge_type: String,
    pub max_timestamp: i64,
    pub last: Option<Edge>,
    pub mode: SearchMode,
}

impl EdgeSearch {
    fn new(node: Id, edge_type: impl Into<String>, mode: SearchMode) -> Self {
        EdgeSearch {
            node,
            edge_type: edge_type.into(),
            max_timestamp: i64::MAX,
            last: None,
            mode,
        }
    }

    pub fn from_source(node: Id, edge_type: impl Into<String>) -> Self {
        Self::new(node, edge_type, SearchMode::FromSource)
    }

    pub fn to_target(node: Id, edge_type: impl Into<String>) -> Self {
        Self::new(node, edge_type, SearchMode::ToTarget)
    }

    pub fn from_source_by_target_type(
        node: Id,
        edge_type: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        Self::new(node, edge_type, SearchMode::FromSourceByTargetType(target_type.into()))
    }

    pub fn to_target_by_source_type(
        node: Id,
        edge_type: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self::new(node, edge_type, SearchMode::ToTargetBySourceType(source_type.into()))
    }

    pub fn versions(source: Id, edge_type: impl Into<String>, target: Id) -> Self {
        Self::new(source, edge_type, SearchMode::Versions { target })
    }

    /// Only return edges with `timestamp <= max_timestamp`
    pub fn max_timestamp(mut self, max_timestamp: i64) -> Self {
        self.max_timestamp = max_timestamp;
        self
    }

    /// Resume strictly after `last`
    pub fn after(mut self, last: Edge) -> Self {
        self.last = Some(last);
        self
    }

    /// Does `edge` belong to the adjacency list this search walks?
    pub fn covers(&self, edge: &Edge) -> bool {
        if edge.edge_type != self.edge_type {
            return false;
        }
        match &self.mode {
            SearchMode::FromSource => edge.source == self.node,
            SearchMode::ToTarget => edge.target == self.node,
            SearchMode::FromSourceByTargetType(t) => {
                edge.source == self.node && edge.target.id_type() == t
            }
            SearchMode::ToTargetBySourceType(t) => {
                edge.target == self.node && edge.source.id_type() == t
            }
            SearchMode::Versions { target } => {
                edge.source == self.node && &edge.target == target
            }
        }
    }

    pub fn validate(&self) -> GraphResult<()> {
        validate_id(&self.node, "search node")?;
        validate_type(&self.edge_type, "search edge type")?;
        validate_timestamp(self.max_timestamp, "max timestamp")?;

        match &self.mode {
            SearchMode::FromSourceByTargetType(t) => validate_type(t, "target id type")?,
            SearchMode::ToTargetBySourceType(t) => validate_type(t, "source id type")?,
            SearchMode::Versions { target } => validate_id(target, "version target")?,
            SearchMode::FromSource | SearchMode::ToTarget => {}
        }

        if let Some(last) = &self.last {
            if !self.covers(last) {
                return Err(GraphError::Validation(format!(
                    "cursor {} does not belong to this search",
                    last
                )));
            }
        }
        Ok(())
    }
}

/// Listing of edge types (when `edge_type` is `None`) or of peer id types
/// under one edge type (when it is `Some`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSearch {
    pub node: Id,
    pub edge_type: Option<String>,
    pub prefix: Option<String>,
    pub last: Option<String>,
}

impl TypeSearch {
    pub fn edge_types(node: Id) -> Self {
        TypeSearch {
            node,
            edge_type: None,
            prefix: None,
            last: None,
        }
    }

    pub fn id_types(node: Id, edge_type: impl Into<String>) -> Self {
        TypeSearch {
            node,
            edge_type: Some(edge_type.into()),
            prefix: None,
            last: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn after(mut self, last: impl Into<String>) -> Self {
        self.last = Some(last.into());
        self
    }

    pub fn validate(&self) -> GraphResult<()> {
        validate_id(&self.node, "search node")?;
        if let Some(edge_type) = &self.edge_type {
            validate_type(edge_type, "search edge type")?;
        }
        Ok(())
    }
}
