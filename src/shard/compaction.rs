//! Shard group compaction and background evaluation
//!
//! A group's compaction target is its oldest uncompacted shard. Once the
//! target is older than the group delta, no writer can still be routing to
//! the other members, so every edge they hold at or above the target's index
//! is moved into the target. A pass that moves nothing finalizes the group:
//! the target is rewritten as compacted and the drained members are removed.

use super::allocation::NodeShardAllocation;
use super::counter::NodeShardApproximation;
use super::group::ShardEntryGroup;
use super::search::NodeShardGroupSearch;
use super::serialization::EdgeShardSerialization;
use super::types::{is_deleted_value, DirectedEdgeMeta, Shard};
use crate::graph::{GraphConfig, GraphError, GraphResult, Scope, TimeService};
use crate::persistence::{encode_i64, ColumnRange, ColumnStore, MutationBatch};
use indexmap::IndexMap;
use rand::Rng;
use rustc_hash::FxHashSet;
use std::ops::Bound;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Passes before compaction gives up and waits for the next evaluation
const MAX_PASSES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    pub target: Shard,
    pub sources: Vec<Shard>,
    /// Edges moved out of each source
    pub copied: IndexMap<Shard, usize>,
    /// Source shards whose definitions were removed
    pub removed: Vec<Shard>,
    /// The rewritten target, when compaction finished
    pub compacted: Option<Shard>,
}

impl CompactionResult {
    pub fn total_copied(&self) -> usize {
        self.copied.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditResult {
    /// Skipped by chance, busy, or too early
    NotChecked,
    /// Audited, no shard needed
    CheckedNoOp,
    /// Audited and a new shard was allocated
    CheckedCreated,
    /// The same compaction is already running
    Compacting,
    Compacted(CompactionResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TaskKey {
    bucket: Vec<u8>,
    target: Option<i64>,
}

/// In-flight audits and compactions
#[derive(Clone, Default)]
struct TaskTracker {
    running: Arc<Mutex<FxHashSet<TaskKey>>>,
}

impl TaskTracker {
    fn try_acquire(&self, key: TaskKey) -> Option<TaskGuard> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(key.clone()) {
            return None;
        }
        Some(TaskGuard {
            running: self.running.clone(),
            key,
        })
    }
}

struct TaskGuard {
    running: Arc<Mutex<FxHashSet<TaskKey>>>,
    key: TaskKey,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct ShardGroupCompaction {
    store: Arc<dyn ColumnStore>,
    allocation: NodeShardAllocation,
    search: NodeShardGroupSearch,
    shards: EdgeShardSerialization,
    counter: NodeShardApproximation,
    config: Arc<GraphConfig>,
    time: Arc<dyn TimeService>,
    tasks: TaskTracker,
}

impl ShardGroupCompaction {
    pub fn new(
        store: Arc<dyn ColumnStore>,
        allocation: NodeShardAllocation,
        search: NodeShardGroupSearch,
        shards: EdgeShardSerialization,
        counter: NodeShardApproximation,
        config: Arc<GraphConfig>,
        time: Arc<dyn TimeService>,
    ) -> Self {
        ShardGroupCompaction {
            store,
            allocation,
            search,
            shards,
            counter,
            config,
            time,
            tasks: TaskTracker::default(),
        }
    }

    /// Move a group's edges into its compaction target.
    ///
    /// Fails with [`GraphError::CompactionTooEarly`] while a writer may still
    /// be using one of the other members.
    pub async fn compact(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
        group: &ShardEntryGroup,
    ) -> GraphResult<CompactionResult> {
        let target = group
            .compaction_target()
            .ok_or_else(|| GraphError::NoCompactionTarget(meta.to_string()))?;

        let now = self.time.current_time();
        if !group.should_compact(now) {
            return Err(GraphError::CompactionTooEarly {
                bucket: meta.to_string(),
                target: target.shard_index(),
                ready_at: group.compaction_ready_at().unwrap_or(i64::MAX),
            });
        }

        let sources: Vec<Shard> = group
            .shards()
            .iter()
            .filter(|s| s.shard_index() != target.shard_index())
            .copied()
            .collect();
        let mut result = CompactionResult {
            target,
            sources: sources.clone(),
            copied: sources.iter().map(|s| (*s, 0)).collect(),
            removed: Vec::new(),
            compacted: None,
        };

        for pass in 1..=MAX_PASSES {
            let mut moved = 0;
            for source in &sources {
                let count = self.move_edges(scope, meta, source, &target).await?;
                *result.copied.entry(*source).or_insert(0) += count;
                moved += count;
            }
            debug!("Compaction pass {} for {} moved {} edges", pass, meta, moved);

            if moved == 0 {
                let compacted = Shard::new(target.shard_index(), self.time.current_time(), true);
                let mut batch = self.shards.write_shard_meta(scope, &compacted, meta)?;
                for source in sources.iter().filter(|s| group.can_be_deleted(s)) {
                    batch.merge(self.shards.remove_shard_meta(scope, source, meta));
                    result.removed.push(*source);
                }
                self.store.execute(batch).await?;
                self.search.invalidate(scope, meta).await;

                info!(
                    "Compacted {} into {}: {} edges moved, {} shards removed",
                    meta,
                    compacted,
                    result.total_copied(),
                    result.removed.len()
                );
                result.compacted = Some(compacted);
                return Ok(result);
            }
        }

        warn!(
            "Compaction of {} still moving edges after {} passes",
            meta, MAX_PASSES
        );
        Ok(result)
    }

    /// Copy then delete every edge of `source` at or above `target`'s index
    async fn move_edges(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
        source: &Shard,
        target: &Shard,
    ) -> GraphResult<usize> {
        let cf = meta.column_family();
        let source_row = meta.row_key(scope, source);
        let target_row = meta.row_key(scope, target);
        let page_size = self.config.scan_page_size.max(1);

        let mut start = Bound::Included(encode_i64(target.shard_index()).to_vec());
        let mut moved = 0;
        loop {
            let range = ColumnRange::between(start.clone(), Bound::Unbounded).limit(page_size);
            let page = self.store.scan(cf, &source_row, &range).await?;
            if page.is_empty() {
                break;
            }

            let mut writes = MutationBatch::new();
            let mut deletes = MutationBatch::new();
            for column in &page {
                if !is_deleted_value(&column.value)? {
                    self.counter.increment(&mut writes, scope, target, meta, 1);
                }
                writes.put(
                    cf,
                    target_row.clone(),
                    column.name.clone(),
                    column.value.clone(),
                    column.timestamp,
                );
                deletes.delete(cf, source_row.clone(), column.name.clone(), column.timestamp);
            }
            // The copy must be durable before the original goes away
            self.store.execute(writes).await?;
            self.store.execute(deletes).await?;

            moved += page.len();
            let full = page.len() == page_size;
            match page.into_iter().last() {
                Some(last) if full => start = Bound::Excluded(last.name),
                _ => break,
            }
        }
        Ok(moved)
    }

    /// Audit or compact one group, unless the same task is already running
    pub async fn evaluate_shard_group(
        &self,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
        group: &ShardEntryGroup,
    ) -> GraphResult<AuditResult> {
        let bucket = meta.bucket_key(scope);

        let Some(target) = group.compaction_target() else {
            let key = TaskKey {
                bucket,
                target: None,
            };
            let Some(_guard) = self.tasks.try_acquire(key) else {
                return Ok(AuditResult::NotChecked);
            };
            if self.allocation.audit_max_shard(scope, meta).await? {
                self.search.invalidate(scope, meta).await;
                return Ok(AuditResult::CheckedCreated);
            }
            return Ok(AuditResult::CheckedNoOp);
        };

        let key = TaskKey {
            bucket,
            target: Some(target.shard_index()),
        };
        let Some(_guard) = self.tasks.try_acquire(key) else {
            return Ok(AuditResult::Compacting);
        };
        let result = self.compact(scope, meta, group).await?;
        Ok(AuditResult::Compacted(result))
    }

    /// Evaluate `group` in the background with probability
    /// `shard_repair_chance`. Returns `None` when the roll skips it.
    pub fn schedule(
        self: &Arc<Self>,
        scope: &Scope,
        meta: &DirectedEdgeMeta,
        group: ShardEntryGroup,
    ) -> Option<JoinHandle<AuditResult>> {
        if !rand::thread_rng().gen_bool(self.config.shard_repair_chance) {
            return None;
        }

        let this = Arc::clone(self);
        let scope = scope.clone();
        let meta = meta.clone();
        Some(tokio::spawn(async move {
            match this.evaluate_shard_group(&scope, &meta, &group).await {
                Ok(result) => result,
                Err(GraphError::CompactionTooEarly { ready_at, .. }) => {
                    debug!("Compaction of {} not ready until {}", meta, ready_at);
                    AuditResult::NotChecked
                }
                Err(e) => {
                    warn!("Shard group evaluation for {} failed: {}", meta, e);
                    AuditResult::NotChecked
                }
            }
        }))
    }
}
