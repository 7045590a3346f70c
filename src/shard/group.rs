//! Shard entry groups: generation chains used to reason about compaction
//!
//! A group is built oldest to newest. It opens with any shard, usually a
//! compacted one, and collects the uncompacted shards allocated after it. The
//! next compacted shard closes the group and starts a new one.

use super::types::Shard;
use crate::graph::{GraphError, GraphResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntryGroup {
    /// Ascending by shard index
    shards: Vec<Shard>,
    delta: i64,
    closed: bool,
    bucket: String,
}

impl ShardEntryGroup {
    pub fn new(delta: i64) -> Self {
        Self::for_bucket("unnamed bucket", delta)
    }

    /// A group whose errors name `bucket`
    pub fn for_bucket(bucket: impl Into<String>, delta: i64) -> Self {
        ShardEntryGroup {
            shards: Vec::new(),
            delta,
            closed: false,
            bucket: bucket.into(),
        }
    }

    /// Add the next newer shard.
    ///
    /// Returns `Ok(false)` when `shard` is compacted and the group already has
    /// members: the group closes and `shard` belongs to the next group.
    pub fn add_shard(&mut self, shard: Shard) -> GraphResult<bool> {
        if self.closed {
            return Err(GraphError::GroupClosed {
                bucket: self.bucket.clone(),
                index: shard.shard_index(),
            });
        }
        if let Some(max) = self.shards.last() {
            if shard.shard_index() <= max.shard_index() {
                return Err(GraphError::ShardOrder {
                    bucket: self.bucket.clone(),
                    index: shard.shard_index(),
                    max: max.shard_index(),
                });
            }
            if shard.is_compacted() {
                self.closed = true;
                return Ok(false);
            }
        }
        self.shards.push(shard);
        Ok(true)
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    /// Oldest shard; its index is where the group's range starts
    pub fn min_shard(&self) -> Option<&Shard> {
        self.shards.first()
    }

    pub fn max_shard(&self) -> Option<&Shard> {
        self.shards.last()
    }

    /// Every shard that may hold data, newest first
    pub fn read_shards(&self) -> Vec<Shard> {
        self.shards.iter().rev().copied().collect()
    }

    /// Shards that accept writes at `now`.
    ///
    /// While the group is new every member takes writes, so readers holding a
    /// stale cache still find them. Afterwards only the compaction target does.
    pub fn write_shards(&self, now: i64) -> Vec<Shard> {
        match self.compaction_target() {
            Some(target) if !self.is_new(now) => vec![target],
            _ => self.read_shards(),
        }
    }

    /// Write shards for an edge stamped `timestamp`.
    ///
    /// A shard only ever holds edges at or above its index. Edges older than
    /// every eligible write shard go to the newest member that covers them.
    pub fn write_shards_for(&self, now: i64, timestamp: i64) -> Vec<Shard> {
        let eligible: Vec<Shard> = self
            .write_shards(now)
            .into_iter()
            .filter(|s| s.shard_index() <= timestamp)
            .collect();
        if !eligible.is_empty() {
            return eligible;
        }
        self.shards
            .iter()
            .rev()
            .find(|s| s.shard_index() <= timestamp)
            .or(self.shards.first())
            .copied()
            .into_iter()
            .collect()
    }

    /// Oldest uncompacted shard, if the group has more than one member
    pub fn compaction_target(&self) -> Option<Shard> {
        if self.shards.len() <= 1 {
            return None;
        }
        self.shards.iter().find(|s| !s.is_compacted()).copied()
    }

    pub fn is_compaction_pending(&self) -> bool {
        self.compaction_target().is_some()
    }

    /// Was any member created within the last `delta`?
    pub fn is_new(&self, now: i64) -> bool {
        self.shards
            .iter()
            .map(Shard::created_time)
            .max()
            .is_some_and(|created| now.saturating_sub(self.delta) <= created)
    }

    /// Time at which the compaction target may be compacted
    pub fn compaction_ready_at(&self) -> Option<i64> {
        self.compaction_target()
            .map(|target| target.created_time().saturating_add(self.delta))
    }

    pub fn should_compact(&self, now: i64) -> bool {
        self.compaction_ready_at().is_some_and(|ready_at| now >= ready_at)
    }

    /// May `shard`'s metadata be removed once compaction finishes?
    pub fn can_be_deleted(&self, shard: &Shard) -> bool {
        match self.compaction_target() {
            Some(target) => {
                !shard.is_compacted()
                    && shard.shard_index() != target.shard_index()
                    && self.shards.iter().any(|s| s.shard_index() == shard.shard_index())
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELTA: i64 = 10_000;

    fn group(shards: &[Shard]) -> ShardEntryGroup {
        let mut group = ShardEntryGroup::new(DELTA);
        for shard in shards {
            assert!(group.add_shard(*shard).unwrap());
        }
        group
    }

    #[test]
    fn test_lower_index_is_rejected() {
        let mut group = group(&[Shard::new(1000, 1000, false)]);
        assert!(matches!(
            group.add_shard(Shard::new(999, 2000, false)),
            Err(GraphError::ShardOrder { index: 999, max: 1000, .. })
        ));
        assert!(matches!(
            group.add_shard(Shard::new(1000, 2000, false)),
            Err(GraphError::ShardOrder { .. })
        ));
    }

    #[test]
    fn test_compacted_shard_closes_group() {
        let mut group = group(&[Shard::root(), Shard::new(1000, 1000, false)]);
        assert!(!group.add_shard(Shard::new(2000, 2000, true)).unwrap());
        assert!(group.is_closed());
        assert!(matches!(
            group.add_shard(Shard::new(3000, 3000, false)),
            Err(GraphError::GroupClosed { index: 3000, .. })
        ));

        // A compacted shard may open a fresh group
        let mut next = ShardEntryGroup::new(DELTA);
        assert!(next.add_shard(Shard::new(2000, 2000, true)).unwrap());
    }

    #[test]
    fn test_single_shard_has_no_target() {
        let root = group(&[Shard::root()]);
        assert_eq!(root.compaction_target(), None);
        assert!(!root.should_compact(i64::MAX));
        assert_eq!(root.write_shards(0), vec![Shard::root()]);
    }

    #[test]
    fn test_target_is_oldest_uncompacted() {
        let target = Shard::new(1000, 1000, false);
        let newer = Shard::new(1001, 1001, false);
        let group = group(&[Shard::root(), target, newer]);
        assert_eq!(group.compaction_target(), Some(target));
        assert!(group.can_be_deleted(&newer));
        assert!(!group.can_be_deleted(&target));
        assert!(!group.can_be_deleted(&Shard::root()));
    }

    #[test]
    fn test_should_compact_uses_target_creation_time() {
        let first = group(&[Shard::root()]);
        let second = group(&[Shard::new(1000, 1000, false), Shard::new(1001, 5000, false)]);

        assert!(!first.should_compact(11_001));
        assert!(!second.should_compact(10_999));
        assert!(second.should_compact(11_001));
        assert_eq!(second.compaction_ready_at(), Some(11_000));
    }

    #[test]
    fn test_write_shards_narrow_after_delta() {
        let future = Shard::new(50_000, 20_000, false);
        let group = group(&[Shard::root(), future]);

        // New group: all members take writes
        assert_eq!(group.write_shards(25_000), vec![future, Shard::root()]);
        // Old group: only the target
        assert_eq!(group.write_shards(40_000), vec![future]);

        // Edges below the target's index still land in the root
        assert_eq!(group.write_shards_for(40_000, 100), vec![Shard::root()]);
        assert_eq!(group.write_shards_for(40_000, 60_000), vec![future]);
        assert_eq!(group.write_shards_for(25_000, 100), vec![Shard::root()]);
    }

    #[test]
    fn test_read_shards_include_target() {
        let target = Shard::new(1000, 1000, false);
        let group = group(&[Shard::root(), target]);
        assert!(group.read_shards().contains(&target));
        assert_eq!(group.read_shards().len(), 2);
    }

    #[test]
    fn test_age_check_at_the_far_past() {
        let group = group(&[Shard::root(), Shard::new(1000, 1000, false)]);
        assert!(group.is_new(i64::MIN));
        assert!(!group.is_new(i64::MAX));
    }
}
