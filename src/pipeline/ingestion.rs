//! Batch ingestion: normalize, dedup, fold into the store
//!
//! One call per completed fetch batch:
//! 1. Normalize every row of every outcome against the poll instant
//! 2. Collapse duplicate fingerprints inside the batch
//! 3. Look the survivors up in durable history (chunked)
//! 4. Apply genuinely new records + every observation in one transaction

use super::normalizer::{dedup_within_batch, normalize_outcomes};
use super::store::{AggregateStore, StoreError};
use super::types::{KeyOutcome, NormalizedRecord};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Rows returned by the source, before any filtering
    pub raw_records: usize,
    /// Rows that survived the staleness cutoff
    pub normalized: usize,
    /// Fingerprints not yet in history
    pub new_records: usize,
    /// Calls actually counted by the store
    pub counted: usize,
    pub recency_updates: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn AggregateStore>,
    staleness_cutoff_secs: i64,
}

impl Ingestor {
    pub fn new(store: Arc<dyn AggregateStore>, staleness_cutoff_secs: i64) -> Self {
        Self {
            store,
            staleness_cutoff_secs,
        }
    }

    /// Fold one batch of fetch outcomes polled at `poll_time_ms`
    ///
    /// A store error means nothing from this batch was applied.
    pub fn ingest(
        &self,
        outcomes: &[KeyOutcome],
        poll_time_ms: i64,
    ) -> Result<IngestSummary, StoreError> {
        let raw_records = outcomes.iter().map(|o| o.outcome.records.len()).sum();
        let all = normalize_outcomes(outcomes, poll_time_ms, self.staleness_cutoff_secs);

        let mut summary = IngestSummary {
            raw_records,
            normalized: all.len(),
            ..Default::default()
        };

        if all.is_empty() {
            return Ok(summary);
        }

        let unique = dedup_within_batch(&all);
        let fingerprints: Vec<String> = unique.iter().map(|r| r.fingerprint.clone()).collect();
        let unseen = self.store.filter_unseen(&fingerprints)?;

        let new_records: Vec<NormalizedRecord> = unique
            .into_iter()
            .filter(|r| unseen.contains(&r.fingerprint))
            .collect();
        summary.new_records = new_records.len();

        let applied = self.store.apply_batch(&new_records, &all, poll_time_ms)?;
        summary.counted = applied.counted;
        summary.recency_updates = applied.recency_updates;

        log::debug!(
            "Ingested batch: {} raw, {} fresh, {} new, {} counted",
            summary.raw_records,
            summary.normalized,
            summary.new_records,
            summary.counted
        );

        Ok(summary)
    }
}
