//! Input validation, run before any storage access

use super::edge::Edge;
use super::error::{GraphError, GraphResult};
use super::types::Id;

pub fn validate_id(id: &Id, field: &str) -> GraphResult<()> {
    if id.id_type().trim().is_empty() {
        return Err(GraphError::Validation(format!("{} must have a non-empty type", field)));
    }
    if id.uuid().is_nil() {
        return Err(GraphError::Validation(format!("{} must have a non-nil uuid", field)));
    }
    Ok(())
}

pub fn validate_type(value: &str, field: &str) -> GraphResult<()> {
    if value.trim().is_empty() {
        return Err(GraphError::Validation(format!("{} must not be blank", field)));
    }
    Ok(())
}

pub fn validate_timestamp(value: i64, field: &str) -> GraphResult<()> {
    if value < 0 {
        return Err(GraphError::Validation(format!(
            "{} must not be negative, got {}",
            field, value
        )));
    }
    Ok(())
}

pub fn validate_edge(edge: &Edge) -> GraphResult<()> {
    validate_id(&edge.source, "source node")?;
    validate_id(&edge.target, "target node")?;
    validate_type(&edge.edge_type, "edge type")?;
    validate_timestamp(edge.timestamp, "edge timestamp")
}
