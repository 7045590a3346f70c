//! RocksDB column store
//!
//! Each logical column family maps to a RocksDB column family. A cell lives
//! under the key `u32 row length ++ row ++ column` so one row is one
//! contiguous key range, and its value is a bincode-encoded [`StoredCell`].

use super::column::{
    decode_counter, delete_wins, encode_counter, put_wins, Column, ColumnFamily, ColumnRange,
    ColumnStore, Mutation, MutationBatch, StorageError, StorageResult,
};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, ReadOptions, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Serialized cell for storage
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCell {
    value: Vec<u8>,
    timestamp: i64,
}

/// RocksDB-backed [`ColumnStore`]
pub struct RocksColumnStore {
    db: Arc<DB>,
    /// Serializes batches: puts and deletes read the current cell timestamp first
    write_lock: Mutex<()>,
    path: String,
}

impl RocksColumnStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();

        info!("Opening column store at: {}", path_str);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024); // 64 MB
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::PointInTime);

        let mut cf_descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        cf_descriptors.extend(
            ColumnFamily::ALL
                .iter()
                .map(|cf| ColumnFamilyDescriptor::new(cf.name(), Self::cf_options(*cf))),
        );

        let db = DB::open_cf_descriptors(&opts, &path_str, cf_descriptors)?;

        info!("Column store opened with {} column families", ColumnFamily::ALL.len());

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn cf_options(cf: ColumnFamily) -> Options {
        let mut opts = Options::default();
        match cf {
            // Adjacency rows are large and cold; trade CPU for space
            ColumnFamily::EdgesFromSource
            | ColumnFamily::EdgesFromSourceByTargetType
            | ColumnFamily::EdgesToTarget
            | ColumnFamily::EdgesToTargetBySourceType
            | ColumnFamily::EdgeVersions => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            _ => opts.set_compression_type(rocksdb::DBCompressionType::Lz4),
        }
        opts
    }

    fn handle(&self, cf: ColumnFamily) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| StorageError::ColumnFamily(cf.name().to_string()))
    }

    fn row_prefix(row: &[u8]) -> StorageResult<Vec<u8>> {
        let len = u32::try_from(row.len())
            .map_err(|_| StorageError::Corrupt(format!("row key of {} bytes", row.len())))?;
        let mut prefix = Vec::with_capacity(4 + row.len());
        prefix.extend_from_slice(&len.to_be_bytes());
        prefix.extend_from_slice(row);
        Ok(prefix)
    }

    fn cell_key(row: &[u8], column: &[u8]) -> StorageResult<Vec<u8>> {
        let mut key = Self::row_prefix(row)?;
        key.extend_from_slice(column);
        Ok(key)
    }

    /// Smallest key greater than every key starting with `prefix`
    fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < u8::MAX {
                end.push(last + 1);
                return Some(end);
            }
        }
        None
    }

    fn with_suffix(mut key: Vec<u8>, suffix: &[u8]) -> Vec<u8> {
        key.extend_from_slice(suffix);
        key
    }

    /// Translate a column range into [lower, upper) key bounds
    fn key_bounds(row: &[u8], range: &ColumnRange) -> StorageResult<(Vec<u8>, Option<Vec<u8>>)> {
        let prefix = Self::row_prefix(row)?;
        let lower = match &range.start {
            Bound::Included(c) => Self::with_suffix(prefix.clone(), c),
            Bound::Excluded(c) => Self::with_suffix(Self::with_suffix(prefix.clone(), c), &[0]),
            Bound::Unbounded => prefix.clone(),
        };
        let upper = match &range.end {
            Bound::Included(c) => Some(Self::with_suffix(Self::with_suffix(prefix.clone(), c), &[0])),
            Bound::Excluded(c) => Some(Self::with_suffix(prefix.clone(), c)),
            Bound::Unbounded => Self::prefix_end(&prefix),
        };
        Ok((lower, upper))
    }

    fn read_range(
        &self,
        cf: ColumnFamily,
        row: &[u8],
        range: &ColumnRange,
    ) -> StorageResult<Vec<Column>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let handle = self.handle(cf)?;
        let (lower, upper) = Self::key_bounds(row, range)?;
        let prefix_len = 4 + row.len();

        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_lower_bound(lower);
        if let Some(upper) = upper {
            read_opts.set_iterate_upper_bound(upper);
        }
        let mode = if range.reversed {
            IteratorMode::End
        } else {
            IteratorMode::Start
        };

        let mut columns = Vec::new();
        for item in self.db.iterator_cf_opt(handle, read_opts, mode) {
            if columns.len() >= range.limit {
                break;
            }
            let (key, value) = item?;
            let cell: StoredCell = bincode::deserialize(&value)?;
            columns.push(Column {
                name: key[prefix_len..].to_vec(),
                value: cell.value,
                timestamp: cell.timestamp,
            });
        }
        Ok(columns)
    }

    fn read_cell(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<StoredCell>> {
        let handle = self.handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Cell state of the batch in flight, layered over the database
struct Overlay<'a> {
    store: &'a RocksColumnStore,
    cells: HashMap<(ColumnFamily, Vec<u8>), Option<StoredCell>>,
}

impl<'a> Overlay<'a> {
    fn current(&mut self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<StoredCell>> {
        if let Some(cell) = self.cells.get(&(cf, key.to_vec())) {
            return Ok(cell.clone());
        }
        let cell = self.store.read_cell(cf, key)?;
        self.cells.insert((cf, key.to_vec()), cell.clone());
        Ok(cell)
    }

    fn set(&mut self, cf: ColumnFamily, key: Vec<u8>, cell: Option<StoredCell>) {
        self.cells.insert((cf, key), cell);
    }

    fn apply(&mut self, mutation: Mutation) -> StorageResult<()> {
        match mutation {
            Mutation::Put {
                cf,
                row,
                column,
                value,
                timestamp,
            } => {
                let key = RocksColumnStore::cell_key(&row, &column)?;
                let existing = self.current(cf, &key)?.map(|c| c.timestamp);
                if put_wins(existing, timestamp) {
                    self.set(cf, key, Some(StoredCell { value, timestamp }));
                }
            }
            Mutation::Delete {
                cf,
                row,
                column,
                timestamp,
            } => {
                let key = RocksColumnStore::cell_key(&row, &column)?;
                if let Some(cell) = self.current(cf, &key)? {
                    if delete_wins(cell.timestamp, timestamp) {
                        self.set(cf, key, None);
                    }
                }
            }
            Mutation::DeleteRow { cf, row, timestamp } => {
                let prefix = RocksColumnStore::row_prefix(&row)?;
                let mut keys: Vec<Vec<u8>> = self
                    .store
                    .read_range(cf, &row, &ColumnRange::all())?
                    .into_iter()
                    .map(|c| RocksColumnStore::cell_key(&row, &c.name))
                    .collect::<StorageResult<_>>()?;
                keys.extend(
                    self.cells
                        .keys()
                        .filter(|(family, key)| *family == cf && key.starts_with(&prefix))
                        .map(|(_, key)| key.clone()),
                );
                for key in keys {
                    if let Some(cell) = self.current(cf, &key)? {
                        if delete_wins(cell.timestamp, timestamp) {
                            self.set(cf, key, None);
                        }
                    }
                }
            }
            Mutation::Increment {
                cf,
                row,
                column,
                delta,
            } => {
                let key = RocksColumnStore::cell_key(&row, &column)?;
                let current = match self.current(cf, &key)? {
                    Some(cell) => decode_counter(&cell.value)?,
                    None => 0,
                };
                self.set(
                    cf,
                    key,
                    Some(StoredCell {
                        value: encode_counter(current.saturating_add(delta)),
                        timestamp: 0,
                    }),
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ColumnStore for RocksColumnStore {
    async fn execute(&self, batch: MutationBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let count = batch.len();
        let mut overlay = Overlay {
            store: self,
            cells: HashMap::new(),
        };
        for mutation in batch.into_mutations() {
            overlay.apply(mutation)?;
        }

        let mut write_batch = WriteBatch::default();
        for ((cf, key), cell) in overlay.cells {
            let handle = self.handle(cf)?;
            match cell {
                Some(cell) => write_batch.put_cf(handle, key, bincode::serialize(&cell)?),
                None => write_batch.delete_cf(handle, key),
            }
        }
        self.db.write(write_batch)?;

        debug!("Executed batch of {} mutations", count);
        Ok(())
    }

    async fn scan(
        &self,
        cf: ColumnFamily,
        row: &[u8],
        range: &ColumnRange,
    ) -> StorageResult<Vec<Column>> {
        self.read_range(cf, row, range)
    }

    async fn get(
        &self,
        cf: ColumnFamily,
        row: &[u8],
        column: &[u8],
    ) -> StorageResult<Option<Column>> {
        Ok(self
            .read_cell(cf, &Self::cell_key(row, column)?)?
            .map(|cell| Column {
                name: column.to_vec(),
                value: cell.value,
                timestamp: cell.timestamp,
            }))
    }

    async fn last_columns(
        &self,
        cf: ColumnFamily,
        rows: &[Vec<u8>],
    ) -> StorageResult<Vec<Option<Column>>> {
        let newest = ColumnRange::all().reversed().limit(1);
        rows.iter()
            .map(|row| -> StorageResult<Option<Column>> {
                Ok(self.read_range(cf, row, &newest)?.into_iter().next())
            })
            .collect()
    }
}
