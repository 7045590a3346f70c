//! Persistence layer
//!
//! The engine talks to its backing wide-column store only through the
//! [`ColumnStore`] port:
//! - batched, all-or-nothing mutation execution
//! - paginated, cursor-resumable column scans
//! - atomic counter cells
//!
//! Two backends ship with the crate: [`MemoryColumnStore`] for tests and
//! embedding, and [`RocksColumnStore`] for on-disk storage.

pub mod codec;
pub mod column;
pub mod memory;
pub mod storage;

pub use codec::{decode_i64, encode_i64, KeyBuilder, KeyReader};
pub use column::{
    Column, ColumnFamily, ColumnRange, ColumnStore, Mutation, MutationBatch, StorageError,
    StorageResult,
};
pub use memory::MemoryColumnStore;
pub use storage::RocksColumnStore;
