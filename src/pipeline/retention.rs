//! Retention sweeper
//!
//! Runs on its own timer, independent of the poll cycle. Everything older
//! than the trailing horizon is deleted: dedup history (so a recurrence is
//! counted again), CLI rows, ranges, then CLI rows left without a range.

use super::store::{AggregateStore, StoreError};
use super::types::SweepReport;
use crate::now_millis;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub struct RetentionSweeper {
    store: Arc<dyn AggregateStore>,
    horizon_ms: i64,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn AggregateStore>, horizon_ms: i64, period: Duration) -> Self {
        Self {
            store,
            horizon_ms,
            period,
        }
    }

    pub fn sweep_once(&self, now_ms: i64) -> Result<SweepReport, StoreError> {
        let cutoff_ms = now_ms - self.horizon_ms;
        let report = self.store.sweep(cutoff_ms)?;

        if report.is_empty() {
            log::debug!("🧹 Sweep: nothing older than {}ms", self.horizon_ms);
        } else {
            log::info!("🧹 Retention sweep complete");
            log::info!("   ├─ History pruned: {}", report.history_pruned);
            log::info!("   ├─ CLI rows pruned: {}", report.clis_pruned);
            log::info!("   ├─ Ranges pruned: {}", report.ranges_pruned);
            log::info!("   └─ Orphan CLI rows pruned: {}", report.orphan_clis_pruned);
        }
        Ok(report)
    }

    /// Sweep every `period` until cancelled
    pub async fn run(self) {
        log::info!(
            "⏰ Starting retention sweeper (interval: {}s, horizon: {}s)",
            self.period.as_secs(),
            self.horizon_ms / 1000
        );

        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if let Err(e) = self.sweep_once(now_millis()) {
                log::error!("❌ Retention sweep failed: {}", e);
            }
        }
    }
}
