//! Core data structures for the sighting pipeline
//!
//! All timestamps are Unix milliseconds (`*_ms`). Ages are whole seconds.

use serde::{Deserialize, Serialize};

/// One table row as returned by the portal, before any interpretation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub range: String,
    pub call: String,
    pub cli: String,
    /// Human relative age, e.g. "just now", "12 sec", "3 min ago"
    pub relative_age: String,
}

/// Result of one fetch for one query key
///
/// `auth_error == true` always comes with an empty `records`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub auth_error: bool,
}

impl FetchOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn auth_failure() -> Self {
        Self {
            records: Vec::new(),
            auth_error: true,
        }
    }

    pub fn with_records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            auth_error: false,
        }
    }
}

/// Fetch outcome tagged with the query key that produced it
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    pub key: String,
    pub outcome: FetchOutcome,
}

/// A sighting with its relative age resolved against the poll instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub range: String,
    pub call: String,
    pub cli: String,
    /// Query key (country) whose poll produced this row
    pub source_key: String,
    pub observed_at_ms: i64,
    pub age_seconds: i64,
    pub fingerprint: String,
}

/// Per-range leaderboard row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAggregate {
    pub name: String,
    pub source_key: String,
    /// Cumulative, never decreases while the row exists
    pub total_calls: i64,
    /// Retained CLI rows for this range; shrinks when the sweeper prunes
    pub active_cli_count: i64,
    pub last_seen_at_ms: i64,
}

/// Per-(range, cli) counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliAggregate {
    pub range: String,
    pub cli: String,
    pub call_count: i64,
    pub last_seen_at_ms: i64,
}

/// Read model handed to presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeView {
    pub name: String,
    pub source_key: String,
    pub calls: i64,
    pub cli_count: i64,
    pub last_seen_at_millis: i64,
    /// Up to three CLIs with the newest sightings
    pub recent_clis: Vec<String>,
}

/// Persisted per-key emptiness counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub source_key: String,
    pub consecutive_empty_polls: u32,
    pub blacklisted: bool,
}

/// What a single `apply_batch` changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Fingerprints newly written to history (= calls counted)
    pub counted: usize,
    /// Ranges whose `last_seen_at_ms` moved forward
    pub recency_updates: usize,
    pub ranges_touched: usize,
}

/// What a single retention sweep deleted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub history_pruned: usize,
    pub clis_pruned: usize,
    pub ranges_pruned: usize,
    pub orphan_clis_pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.history_pruned == 0
            && self.clis_pruned == 0
            && self.ranges_pruned == 0
            && self.orphan_clis_pruned == 0
    }
}
