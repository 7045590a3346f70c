//! Row layouts for edges, type metadata and node marks
//!
//! Writers return deferred [`MutationBatch`](crate::persistence::MutationBatch)es;
//! callers merge and execute them so that several logical writes commit as
//! one physical write.

pub mod edge;
pub mod metadata;
pub mod node;

pub use edge::{versions_row_key, EdgePages, EdgeSerialization, ShardedEdgeSerialization};
pub use metadata::EdgeMetadataSerialization;
pub use node::NodeSerialization;
