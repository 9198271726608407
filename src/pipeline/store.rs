//! Store traits shared by the SQLite store and the in-memory store
//!
//! Every component holds `Arc<dyn AggregateStore>` / `Arc<dyn BlacklistStore>`,
//! never a concrete type. Each multi-step mutation is one transaction: a
//! concurrent reader sees either none or all of a batch.

use super::types::{
    BatchSummary, BlacklistEntry, CliAggregate, NormalizedRecord, RangeAggregate, RangeView,
    SweepReport,
};
use std::collections::HashSet;

/// Max fingerprints per `IN (...)` lookup
pub const FINGERPRINT_CHUNK_SIZE: usize = 500;

/// Number of newest CLIs attached to each `RangeView`
pub const RECENT_CLI_LIMIT: usize = 3;

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// A lock guarding a connection or the in-memory state was poisoned
    Poisoned(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Poisoned(what) => write!(f, "Lock poisoned: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

/// Dedup history + leaderboard aggregates
pub trait AggregateStore: Send + Sync {
    /// Subset of `fingerprints` not present in history
    fn filter_unseen(&self, fingerprints: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Fold one batch into history and aggregates, atomically
    ///
    /// 1. insert `new_records` fingerprints into history (ignore on conflict)
    /// 2. for each fingerprint actually inserted: `total_calls += 1`, upsert CLI row
    /// 3. for every record in `all_records`: raise range `last_seen_at_ms`
    /// 4. recompute `active_cli_count` of touched ranges
    ///
    /// Any failure rolls the whole batch back.
    fn apply_batch(
        &self,
        new_records: &[NormalizedRecord],
        all_records: &[NormalizedRecord],
        now_ms: i64,
    ) -> Result<BatchSummary, StoreError>;

    /// Ranges by `total_calls` desc, then `active_cli_count` desc
    fn top_ranges(&self, limit: usize) -> Result<Vec<RangeView>, StoreError>;

    /// Same ordering, restricted to ranges whose name or source key contains
    /// `keyword` (case-insensitive)
    fn search_ranges(&self, keyword: &str, limit: usize) -> Result<Vec<RangeView>, StoreError>;

    /// Delete history and aggregates older than `cutoff_ms`, then orphans
    fn sweep(&self, cutoff_ms: i64) -> Result<SweepReport, StoreError>;

    fn range(&self, name: &str) -> Result<Option<RangeAggregate>, StoreError>;

    fn clis_for_range(&self, name: &str) -> Result<Vec<CliAggregate>, StoreError>;

    fn history_len(&self) -> Result<usize, StoreError>;
}

/// Durable per-key emptiness counters
pub trait BlacklistStore: Send + Sync {
    fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError>;

    fn save_blacklist_entry(&self, entry: &BlacklistEntry, now_ms: i64) -> Result<(), StoreError>;
}

/// Case-insensitive containment used by every `search_ranges` implementation
pub(crate) fn matches_keyword(view: &RangeView, keyword_lower: &str) -> bool {
    keyword_lower.is_empty()
        || view.name.to_lowercase().contains(keyword_lower)
        || view.source_key.to_lowercase().contains(keyword_lower)
}
