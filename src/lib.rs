//! # rangewatch
//!
//! Polls a carrier portal for live "range/CLI" call sightings, deduplicates
//! re-reported observations, and keeps a ranked leaderboard of the busiest
//! ranges in SQLite.
//!
//! ## Data flow
//!
//! ```text
//! FetchScheduler ──> SourceProvider ──> normalizer ──> AggregateStore ──> ranking
//!       │                  │                                 ▲
//!       │                  └── auth failure ──> SessionManager
//!       └── per-key outcome ──> BlacklistController     RetentionSweeper
//! ```
//!
//! ## Module Organization
//!
//! - `pipeline` - ingestion, dedup, aggregation, ranking, blacklist, retention
//! - `session` - authenticated session lifecycle (single-flight refresh)
//! - `source` - portal transport and HTML row parsing
//! - `countries` - default query-key universe

pub mod countries;
pub mod pipeline;
pub mod session;
pub mod source;
pub mod sqlite_pragma;

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
