//! Edge graph model and public API
//!
//! This module implements the caller-facing side of the store:
//! - Typed, timestamped, directed edges between opaque ids
//! - Tombstone deletes with point-in-time reads
//! - Node deletes hidden by high-water marks until their cascade finishes
//! - Per-scope [`GraphManager`]s wired by a [`GraphEngine`]

pub mod config;
pub mod edge;
pub mod engine;
pub mod error;
pub mod manager;
pub mod search;
pub mod time;
pub mod types;
pub mod validation;
pub mod visibility;

// Re-export main types
pub use config::GraphConfig;
pub use edge::{Edge, EdgeKey, MarkedEdge};
pub use engine::GraphEngine;
pub use error::{GraphError, GraphResult};
pub use manager::{EdgeStream, GraphManager, TypeStream};
pub use search::{EdgeSearch, SearchMode, TypeSearch};
pub use time::{ManualTimeService, SystemTimeService, TimeService};
pub use types::{Id, Scope};
pub use visibility::VisibilityFilter;
