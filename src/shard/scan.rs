//! Descending merge over the same bucket row in several shards
//!
//! Each row is paged independently. Columns come back in one global
//! descending order; a column present in more than one shard is returned
//! once.

use crate::persistence::{Column, ColumnFamily, ColumnRange, ColumnStore, StorageResult};
use futures::future::try_join_all;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

struct RowCursor {
    row: Vec<u8>,
    buffer: VecDeque<Column>,
    /// Upper bound of the next fetch
    end: Bound<Vec<u8>>,
    exhausted: bool,
}

pub struct MergedShardScan {
    store: Arc<dyn ColumnStore>,
    cf: ColumnFamily,
    cursors: Vec<RowCursor>,
    start: Bound<Vec<u8>>,
    page_size: usize,
    last_emitted: Option<Vec<u8>>,
}

impl MergedShardScan {
    /// Scan `rows` from `end` down to `start`
    pub fn descending(
        store: Arc<dyn ColumnStore>,
        cf: ColumnFamily,
        rows: Vec<Vec<u8>>,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        page_size: usize,
    ) -> Self {
        let cursors = rows
            .into_iter()
            .map(|row| RowCursor {
                row,
                buffer: VecDeque::new(),
                end: end.clone(),
                exhausted: false,
            })
            .collect();
        MergedShardScan {
            store,
            cf,
            cursors,
            start,
            page_size: page_size.max(1),
            last_emitted: None,
        }
    }

    /// Fetch the next page for every drained, non-exhausted row at once
    async fn refill(&mut self) -> StorageResult<()> {
        let mut pending = Vec::new();
        for (i, cursor) in self.cursors.iter_mut().enumerate() {
            if !cursor.buffer.is_empty() || cursor.exhausted {
                continue;
            }
            let range = ColumnRange::between(self.start.clone(), cursor.end.clone())
                .reversed()
                .limit(self.page_size);
            if range.is_empty() {
                cursor.exhausted = true;
            } else {
                pending.push((i, range));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let cf = self.cf;
        let indexes: Vec<usize> = pending.iter().map(|(i, _)| *i).collect();
        let fetches: Vec<_> = pending
            .into_iter()
            .map(|(i, range)| {
                let store = self.store.clone();
                let row = self.cursors[i].row.clone();
                async move { store.scan(cf, &row, &range).await }
            })
            .collect();
        let pages = try_join_all(fetches).await?;

        for (i, page) in indexes.into_iter().zip(pages) {
            let cursor = &mut self.cursors[i];
            cursor.exhausted = page.len() < self.page_size;
            if let Some(last) = page.last() {
                cursor.end = Bound::Excluded(last.name.clone());
            }
            cursor.buffer.extend(page);
        }
        Ok(())
    }

    /// Up to one page of columns, greatest first. Empty once every row is done.
    pub async fn next_page(&mut self) -> StorageResult<Vec<Column>> {
        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size {
            self.refill().await?;

            let next = self
                .cursors
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.buffer.front().map(|col| (i, col)))
                .max_by(|(_, a), (_, b)| a.name.cmp(&b.name))
                .map(|(i, _)| i);
            let Some(i) = next else {
                break;
            };
            let Some(column) = self.cursors[i].buffer.pop_front() else {
                break;
            };

            if self.last_emitted.as_deref() == Some(column.name.as_slice()) {
                continue;
            }
            self.last_emitted = Some(column.name.clone());
            page.push(column);
        }
        Ok(page)
    }

    /// Drain the scan
    pub async fn collect_all(mut self) -> StorageResult<Vec<Column>> {
        let mut all = Vec::new();
        loop {
            let page = self.next_page().await?;
            if page.is_empty() {
                return Ok(all);
            }
            all.extend(page);
        }
    }
}
