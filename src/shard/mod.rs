//! Shard management
//!
//! Every bucket's adjacency list is split over time-indexed shards:
//! - `Shard`/`DirectedEdgeMeta`: what a shard is and how a bucket lays out rows
//! - `ShardEntryGroup`: generation chains used to decide compaction safety
//! - `NodeShardAllocation`: root creation, future-shard pruning and audits
//! - `NodeShardGroupSearch`: cached group lookups for reads and writes
//! - `ShardGroupCompaction`: merging a group into its compaction target

pub mod allocation;
pub mod cache;
pub mod compaction;
pub mod counter;
pub mod group;
pub mod scan;
pub mod search;
pub mod serialization;
pub mod types;

pub use allocation::NodeShardAllocation;
pub use cache::ShardCache;
pub use compaction::{AuditResult, CompactionResult, ShardGroupCompaction};
pub use counter::NodeShardApproximation;
pub use group::ShardEntryGroup;
pub use scan::MergedShardScan;
pub use search::NodeShardGroupSearch;
pub use serialization::EdgeShardSerialization;
pub use types::{edge_value, is_deleted_value, DirectedEdgeMeta, Direction, Shard};
