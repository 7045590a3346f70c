//! Error taxonomy for graph operations

use crate::persistence::StorageError;
use thiserror::Error;

/// Errors that can occur during graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Malformed input, rejected before any storage access
    #[error("Validation error: {0}")]
    Validation(String),

    /// A shard index was inserted at or below the current maximum
    #[error("Shard order violated in {bucket}: index {index} is not above {max}")]
    ShardOrder {
        bucket: String,
        index: i64,
        max: i64,
    },

    /// A shard was added to a group already closed by a compacted shard
    #[error("Shard group in {bucket} is closed; cannot add shard {index}")]
    GroupClosed { bucket: String, index: i64 },

    /// The compaction target is still younger than the compaction delta
    #[error("Compaction cannot be run yet for {bucket}: target shard {target} is ready at {ready_at}")]
    CompactionTooEarly {
        bucket: String,
        target: i64,
        ready_at: i64,
    },

    /// The group has nothing to compact
    #[error("No compaction target in {0}")]
    NoCompactionTarget(String),

    /// The backing store failed to execute a mutation or return a page
    #[error("Operation failed: {0}")]
    Storage(#[from] StorageError),

    /// The repair pipeline is gone; the tombstone is durable but the cascade did not start
    #[error("Repair pipeline unavailable: {0}")]
    RepairUnavailable(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GraphError {
    /// Compaction-too-early is expected back-pressure, not a failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::CompactionTooEarly { .. })
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
