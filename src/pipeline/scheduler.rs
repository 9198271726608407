//! Fetch scheduler
//!
//! Walks the blacklist-filtered key universe in fixed-size batches. Every key
//! in a batch is fetched concurrently; the batch is folded into the store only
//! after all fetches settle. Each fetch has a hard outer deadline so a hung
//! transport resolves to "no data" instead of stalling the batch.
//!
//! The first full pass is the initial sweep (reported as startup progress);
//! after that the scheduler cycles round-robin forever.

use super::blacklist::BlacklistController;
use super::config::PipelineConfig;
use super::ingestion::{IngestSummary, Ingestor};
use super::stats::PollStats;
use super::types::{FetchOutcome, KeyOutcome};
use crate::now_millis;
use crate::session::SessionManager;
use crate::source::SourceProvider;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

/// What one batch produced
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub keys: usize,
    pub auth_failures: usize,
    pub ingest: Option<IngestSummary>,
    pub newly_blacklisted: Vec<String>,
}

pub struct FetchScheduler {
    source: Arc<dyn SourceProvider>,
    session: Arc<SessionManager>,
    blacklist: Arc<BlacklistController>,
    ingestor: Ingestor,
    stats: Arc<PollStats>,
    universe: Vec<String>,
    batch_size: usize,
    fetch_deadline: Duration,
    batch_delay: Duration,
    cursor: usize,
}

impl FetchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &PipelineConfig,
        universe: Vec<String>,
        source: Arc<dyn SourceProvider>,
        session: Arc<SessionManager>,
        blacklist: Arc<BlacklistController>,
        ingestor: Ingestor,
        stats: Arc<PollStats>,
    ) -> Self {
        Self {
            source,
            session,
            blacklist,
            ingestor,
            stats,
            universe,
            batch_size: config.batch_size.max(1),
            fetch_deadline: config.fetch_deadline(),
            batch_delay: config.batch_delay(),
            cursor: 0,
        }
    }

    /// Universe minus blacklisted keys, recomputed on every call
    pub fn active_keys(&self) -> Vec<String> {
        self.blacklist.active_keys(&self.universe)
    }

    /// Next round-robin batch over the current active keys
    ///
    /// Never longer than the active set, so no key appears twice in a batch.
    pub fn next_batch(&mut self) -> Vec<String> {
        let active = self.active_keys();
        if active.is_empty() {
            return Vec::new();
        }

        let len = active.len();
        let size = self.batch_size.min(len);
        let start = self.cursor % len;
        let batch = (0..size).map(|i| active[(start + i) % len].clone()).collect();
        self.cursor = (start + size) % len;
        batch
    }

    async fn fetch_one(&self, key: String) -> KeyOutcome {
        let session = match self.session.ensure_valid_session().await {
            Ok(session) => session,
            Err(e) => {
                log::debug!("No session for {}: {}", key, e);
                self.stats.record_auth_failure();
                self.blacklist.mark_auth_failure();
                return KeyOutcome {
                    key,
                    outcome: FetchOutcome::auth_failure(),
                };
            }
        };

        let outcome = match timeout(self.fetch_deadline, self.source.fetch(&key, &session)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::debug!("Fetch deadline exceeded for {}", key);
                self.stats.record_timeout();
                FetchOutcome::empty()
            }
        };

        self.stats.record_request(outcome.records.len());

        if outcome.auth_error {
            self.stats.record_auth_failure();
            self.blacklist.mark_auth_failure();
            if let Err(e) = self.session.refresh_after_rejection(&session, "login required").await {
                log::warn!("⚠️  Session refresh after rejection failed: {}", e);
            }
        }

        KeyOutcome { key, outcome }
    }

    /// Fetch `keys` concurrently, then update blacklist counters and fold the
    /// rows into the store
    pub async fn run_batch(&self, keys: &[String]) -> BatchReport {
        let outcomes = join_all(keys.iter().cloned().map(|key| self.fetch_one(key))).await;
        let now_ms = now_millis();

        let mut report = BatchReport {
            keys: keys.len(),
            ..Default::default()
        };

        for KeyOutcome { key, outcome } in &outcomes {
            if outcome.auth_error {
                report.auth_failures += 1;
            }
            match self.blacklist.observe(key, outcome, now_ms) {
                Ok(true) => report.newly_blacklisted.push(key.clone()),
                Ok(false) => {}
                Err(e) => log::error!("❌ Failed to update blacklist for {}: {}", key, e),
            }
        }

        match self.ingestor.ingest(&outcomes, now_ms) {
            Ok(summary) => {
                self.stats.record_batch(summary.counted);
                report.ingest = Some(summary);
            }
            Err(e) => {
                self.stats.record_batch(0);
                log::error!("❌ Batch rolled back: {}", e);
            }
        }

        report
    }

    /// One full pass over the active keys, reporting progress
    pub async fn run_initial_sweep(&mut self) {
        let active = self.active_keys();
        self.stats.begin_initial_sweep(active.len());

        log::info!("🔍 Initial sweep started");
        log::info!("   ├─ Active keys: {}", active.len());
        log::info!("   ├─ Blacklisted: {}", self.blacklist.blacklisted_count());
        log::info!("   └─ Batch size: {}", self.batch_size);

        for chunk in active.chunks(self.batch_size) {
            let report = self.run_batch(chunk).await;
            self.stats.advance_initial_sweep(chunk.len());
            log::debug!(
                "Initial sweep batch: {} keys, {} counted",
                report.keys,
                report.ingest.as_ref().map_or(0, |s| s.counted)
            );
            sleep(self.batch_delay).await;
        }

        self.stats.finish_initial_sweep();
        let snap = self.stats.snapshot();
        log::info!(
            "✅ Initial sweep complete: {} requests, {} records",
            snap.total_requests,
            snap.total_records
        );
    }

    /// Initial sweep, then round-robin until cancelled
    pub async fn run(mut self) {
        self.run_initial_sweep().await;

        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                log::warn!("⚠️  Every query key is blacklisted, nothing to poll");
                sleep(self.batch_delay.max(Duration::from_secs(5))).await;
                continue;
            }

            let report = self.run_batch(&batch).await;
            if let Some(summary) = &report.ingest {
                if summary.counted > 0 {
                    log::debug!("Batch counted {} new calls", summary.counted);
                }
            }
            sleep(self.batch_delay).await;
        }
    }
}
