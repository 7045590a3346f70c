//! In-memory column store
//!
//! Rows are `BTreeMap`s so column scans come back sorted. A whole batch is
//! applied under one write lock, which gives the all-or-nothing contract.

use super::column::{
    decode_counter, delete_wins, encode_counter, put_wins, Column, ColumnFamily, ColumnRange,
    ColumnStore, Mutation, MutationBatch, StorageError, StorageResult,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct Cell {
    value: Vec<u8>,
    timestamp: i64,
}

type Row = BTreeMap<Vec<u8>, Cell>;
type Family = HashMap<Vec<u8>, Row>;

#[derive(Debug, Default)]
pub struct MemoryColumnStore {
    families: RwLock<HashMap<ColumnFamily, Family>>,
    unavailable: AtomicBool,
    executed: AtomicU64,
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of batches executed so far
    pub fn executed_batches(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Total live cells in a column family
    pub async fn cell_count(&self, cf: ColumnFamily) -> usize {
        let families = self.families.read().await;
        families
            .get(&cf)
            .map(|family| family.values().map(|row| row.len()).sum())
            .unwrap_or(0)
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn to_column(name: &[u8], cell: &Cell) -> Column {
        Column {
            name: name.to_vec(),
            value: cell.value.clone(),
            timestamp: cell.timestamp,
        }
    }

    fn apply(families: &mut HashMap<ColumnFamily, Family>, mutation: Mutation) -> StorageResult<()> {
        match mutation {
            Mutation::Put {
                cf,
                row,
                column,
                value,
                timestamp,
            } => {
                let row = families.entry(cf).or_default().entry(row).or_default();
                if put_wins(row.get(&column).map(|c| c.timestamp), timestamp) {
                    row.insert(column, Cell { value, timestamp });
                }
            }
            Mutation::Delete {
                cf,
                row,
                column,
                timestamp,
            } => {
                if let Some(family) = families.get_mut(&cf) {
                    if let Some(cells) = family.get_mut(&row) {
                        if cells.get(&column).is_some_and(|c| delete_wins(c.timestamp, timestamp)) {
                            cells.remove(&column);
                        }
                        if cells.is_empty() {
                            family.remove(&row);
                        }
                    }
                }
            }
            Mutation::DeleteRow { cf, row, timestamp } => {
                if let Some(family) = families.get_mut(&cf) {
                    if let Some(cells) = family.get_mut(&row) {
                        cells.retain(|_, c| !delete_wins(c.timestamp, timestamp));
                        if cells.is_empty() {
                            family.remove(&row);
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
                let row = families.entry(cf).or_default().entry(row).or_default();
                let current = match row.get(&column) {
                    Some(cell) => decode_counter(&cell.value)?,
                    None => 0,
                };
                row.insert(
                    column,
                    Cell {
                        value: encode_counter(current.saturating_add(delta)),
                        timestamp: 0,
                    },
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn execute(&self, batch: MutationBatch) -> StorageResult<()> {
        self.check_available()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut families = self.families.write().await;
        // Counters are the only cells that can fail to apply; check them up front
        for mutation in batch.mutations() {
            if let Mutation::Increment { cf, row, column, .. } = mutation {
                let existing = families
                    .get(cf)
                    .and_then(|f| f.get(row))
                    .and_then(|cells| cells.get(column));
                if let Some(cell) = existing {
                    decode_counter(&cell.value)?;
                }
            }
        }

        let count = batch.len();
        for mutation in batch.into_mutations() {
            Self::apply(&mut families, mutation)?;
        }

        self.executed.fetch_add(1, Ordering::SeqCst);
        debug!("Executed batch of {} mutations", count);
        Ok(())
    }

    async fn scan(
        &self,
        cf: ColumnFamily,
        row: &[u8],
        range: &ColumnRange,
    ) -> StorageResult<Vec<Column>> {
        self.check_available()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let families = self.families.read().await;
        let Some(cells) = families.get(&cf).and_then(|f| f.get(row)) else {
            return Ok(Vec::new());
        };

        let matching = cells.range::<Vec<u8>, _>((range.start.clone(), range.end.clone()));
        let columns = if range.reversed {
            matching
                .rev()
                .take(range.limit)
                .map(|(name, cell)| Self::to_column(name, cell))
                .collect()
        } else {
            matching
                .take(range.limit)
                .map(|(name, cell)| Self::to_column(name, cell))
                .collect()
        };
        Ok(columns)
    }

    async fn get(
        &self,
        cf: ColumnFamily,
        row: &[u8],
        column: &[u8],
    ) -> StorageResult<Option<Column>> {
        self.check_available()?;
        let families = self.families.read().await;
        Ok(families
            .get(&cf)
            .and_then(|f| f.get(row))
            .and_then(|cells| cells.get(column))
            .map(|cell| Self::to_column(column, cell)))
    }

    async fn last_columns(
        &self,
        cf: ColumnFamily,
        rows: &[Vec<u8>],
    ) -> StorageResult<Vec<Option<Column>>> {
        self.check_available()?;
        let families = self.families.read().await;
        let family = families.get(&cf);
        Ok(rows
            .iter()
            .map(|row| {
                family
                    .and_then(|f| f.get(row))
                    .and_then(|cells| cells.iter().next_back())
                    .map(|(name, cell)| Self::to_column(name, cell))
            })
            .collect())
    }
}
