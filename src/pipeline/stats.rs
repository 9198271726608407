//! Poll statistics and the periodic status line

use super::ranking::RankingService;
use crate::session::SessionManager;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Lock-free counters shared by the scheduler and the status reporter
#[derive(Debug, Default)]
pub struct PollStats {
    total_requests: AtomicU64,
    total_records: AtomicU64,
    auth_failures: AtomicU64,
    timeouts: AtomicU64,
    calls_counted: AtomicU64,
    batches: AtomicU64,
    initial_phase: AtomicBool,
    initial_progress: AtomicUsize,
    initial_total: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_records: u64,
    pub auth_failures: u64,
    pub timeouts: u64,
    pub calls_counted: u64,
    pub batches: u64,
    pub is_initial_phase: bool,
    pub initial_progress: usize,
    pub initial_total: usize,
}

impl PollStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, records: usize) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, counted: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.calls_counted.fetch_add(counted as u64, Ordering::Relaxed);
    }

    pub fn begin_initial_sweep(&self, total: usize) {
        self.initial_total.store(total, Ordering::Relaxed);
        self.initial_progress.store(0, Ordering::Relaxed);
        self.initial_phase.store(true, Ordering::Relaxed);
    }

    pub fn advance_initial_sweep(&self, done: usize) {
        self.initial_progress.fetch_add(done, Ordering::Relaxed);
    }

    pub fn finish_initial_sweep(&self) {
        self.initial_phase.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_records: self.total_records.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            calls_counted: self.calls_counted.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            is_initial_phase: self.initial_phase.load(Ordering::Relaxed),
            initial_progress: self.initial_progress.load(Ordering::Relaxed),
            initial_total: self.initial_total.load(Ordering::Relaxed),
        }
    }
}

/// Log one status line every `period`
pub async fn run_status_reporter(
    stats: Arc<PollStats>,
    session: Arc<SessionManager>,
    ranking: RankingService,
    period: Duration,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately; nothing to report yet
    timer.tick().await;

    loop {
        timer.tick().await;
        let snap = stats.snapshot();

        if snap.is_initial_phase {
            log::info!(
                "📊 Initial sweep {}/{} | requests: {} | records: {} | session: {}",
                snap.initial_progress,
                snap.initial_total,
                snap.total_requests,
                snap.total_records,
                session.status()
            );
            continue;
        }

        let leader = match ranking.leader() {
            Ok(Some(view)) => format!("{} ({} calls, {} CLIs)", view.name, view.calls, view.cli_count),
            Ok(None) => "none".to_string(),
            Err(e) => {
                log::error!("❌ Failed to read leaderboard: {}", e);
                "unavailable".to_string()
            }
        };

        log::info!(
            "📊 requests: {} | records: {} | counted: {} | auth failures: {} | timeouts: {} | session: {} | leader: {}",
            snap.total_requests,
            snap.total_records,
            snap.calls_counted,
            snap.auth_failures,
            snap.timeouts,
            session.status(),
            leader
        );
    }
}
