//! # Sighting pipeline
//!
//! Fetch outcomes flow through here on their way to the leaderboard:
//!
//! 1. `scheduler` fetches one batch of query keys concurrently
//! 2. `blacklist` updates per-key emptiness counters
//! 3. `normalizer` resolves relative ages and builds fingerprints
//! 4. `ingestion` drops fingerprints already in history and folds the rest
//!    into the store in one transaction
//! 5. `ranking` serves top-N / keyword views over committed state
//! 6. `retention` prunes everything outside the trailing horizon
//!
//! ## Accounting
//!
//! `total_calls` is a cumulative counter: it only grows while the range row
//! exists. `active_cli_count` is the number of CLI rows currently retained and
//! shrinks when the sweeper prunes them. Both live on the same row on purpose.
//!
//! ## Module Organization
//!
//! - `types` - core data structures (RawRecord, NormalizedRecord, RangeView)
//! - `config` - environment-driven configuration
//! - `normalizer` - age parsing, time buckets, fingerprints
//! - `store` - store traits + StoreError
//! - `db` - SQLite store (WAL, writer + reader connections)
//! - `memory_store` - in-memory store with the same contract
//! - `ingestion` - normalize → dedup → apply
//! - `scheduler` - batched concurrent polling
//! - `blacklist` - unproductive key removal
//! - `ranking` - leaderboard queries
//! - `retention` - periodic sweeper
//! - `stats` - poll counters + status line

pub mod blacklist;
pub mod config;
pub mod db;
pub mod ingestion;
pub mod memory_store;
pub mod normalizer;
pub mod ranking;
pub mod retention;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use blacklist::BlacklistController;
pub use config::{ConfigError, PipelineConfig};
pub use db::SqliteStore;
pub use ingestion::{IngestSummary, Ingestor};
pub use memory_store::MemoryStore;
pub use ranking::RankingService;
pub use retention::RetentionSweeper;
pub use scheduler::FetchScheduler;
pub use stats::PollStats;
pub use store::{AggregateStore, BlacklistStore, StoreError};
pub use types::{FetchOutcome, KeyOutcome, NormalizedRecord, RangeView, RawRecord};
