//! Engine configuration
//!
//! Read-only tuning inputs. Everything has a default; a YAML document may
//! override any subset of fields.

use super::error::{GraphError, GraphResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Writes counted against a shard before a new one is pre-allocated
    pub shard_size: i64,
    /// TTL of the shard lookup cache, in milliseconds
    pub shard_cache_timeout_ms: i64,
    /// Maximum number of buckets kept in the shard lookup cache
    pub shard_cache_size: usize,
    /// New shards are placed `multiplier * shard_cache_timeout_ms` in the future
    pub shard_lookahead_multiplier: i64,
    /// Minimum age of a compaction target before it may be compacted
    pub shard_min_delta_ms: i64,
    /// Page size for every storage scan
    pub scan_page_size: usize,
    /// Concurrent repair tasks and concurrent metadata probes
    pub repair_concurrent_size: usize,
    /// Edges buffered per batch during a node-delete cascade
    pub repair_buffer_size: usize,
    /// Probability that a written-to shard group is evaluated in the background
    pub shard_repair_chance: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            shard_size: 500_000,
            shard_cache_timeout_ms: 30_000,
            shard_cache_size: 10_000,
            shard_lookahead_multiplier: 2,
            shard_min_delta_ms: 60_000,
            scan_page_size: 100,
            repair_concurrent_size: 20,
            repair_buffer_size: 1_000,
            shard_repair_chance: 0.1,
        }
    }
}

impl GraphConfig {
    /// Parse a (possibly partial) YAML document
    pub fn from_yaml(source: &str) -> GraphResult<Self> {
        let config: GraphConfig =
            serde_yaml::from_str(source).map_err(|e| GraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// How far in the future a newly allocated shard is placed
    pub fn shard_lookahead_ms(&self) -> i64 {
        self.shard_lookahead_multiplier
            .saturating_mul(self.shard_cache_timeout_ms)
    }

    pub fn validate(&self) -> GraphResult<()> {
        if self.shard_size <= 0 {
            return Err(GraphError::Config("shard_size must be positive".to_string()));
        }
        if self.shard_cache_timeout_ms <= 0 {
            return Err(GraphError::Config(
                "shard_cache_timeout_ms must be positive".to_string(),
            ));
        }
        if self.shard_lookahead_multiplier < 1 {
            return Err(GraphError::Config(
                "shard_lookahead_multiplier must be at least 1".to_string(),
            ));
        }
        if self
            .shard_lookahead_multiplier
            .checked_mul(self.shard_cache_timeout_ms)
            .is_none()
        {
            return Err(GraphError::Config(format!(
                "shard lookahead overflows: {} x {}",
                self.shard_lookahead_multiplier, self.shard_cache_timeout_ms
            )));
        }
        if self.shard_min_delta_ms < self.shard_cache_timeout_ms {
            return Err(GraphError::Config(format!(
                "shard_min_delta_ms ({}) must not be below shard_cache_timeout_ms ({})",
                self.shard_min_delta_ms, self.shard_cache_timeout_ms
            )));
        }
        if self.scan_page_size == 0 || self.repair_concurrent_size == 0 || self.repair_buffer_size == 0 {
            return Err(GraphError::Config(
                "page, buffer and concurrency sizes must be positive".to_string(),
            ));
        }
        if u32::try_from(self.repair_concurrent_size).is_err() {
            return Err(GraphError::Config(format!(
                "repair_concurrent_size {} is too large",
                self.repair_concurrent_size
            )));
        }
        if !(0.0..=1.0).contains(&self.shard_repair_chance) {
            return Err(GraphError::Config(format!(
                "shard_repair_chance must be within [0, 1], got {}",
                self.shard_repair_chance
            )));
        }
        Ok(())
    }
}
