//! In-memory store with the same transactional contract as `SqliteStore`
//!
//! A single mutex guards all state, so every operation is trivially atomic.
//! Used by tests and by tooling that does not need durability.

use super::store::{
    matches_keyword, AggregateStore, BlacklistStore, StoreError, RECENT_CLI_LIMIT,
};
use super::types::{
    BatchSummary, BlacklistEntry, CliAggregate, NormalizedRecord, RangeAggregate, RangeView,
    SweepReport,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    history: HashMap<String, i64>,
    ranges: HashMap<String, RangeAggregate>,
    clis: HashMap<(String, String), CliAggregate>,
    blacklist: HashMap<String, BlacklistEntry>,
}

impl Inner {
    fn recount_clis(&mut self, range: &str) {
        let count = self.clis.keys().filter(|(r, _)| r == range).count() as i64;
        if let Some(agg) = self.ranges.get_mut(range) {
            agg.active_cli_count = count;
        }
    }

    fn view(&self, agg: &RangeAggregate) -> RangeView {
        let mut clis: Vec<&CliAggregate> =
            self.clis.values().filter(|c| c.range == agg.name).collect();
        clis.sort_by(|a, b| b.last_seen_at_ms.cmp(&a.last_seen_at_ms).then(a.cli.cmp(&b.cli)));

        RangeView {
            name: agg.name.clone(),
            source_key: agg.source_key.clone(),
            calls: agg.total_calls,
            cli_count: agg.active_cli_count,
            last_seen_at_millis: agg.last_seen_at_ms,
            recent_clis: clis.iter().take(RECENT_CLI_LIMIT).map(|c| c.cli.clone()).collect(),
        }
    }

    fn ranked(&self) -> Vec<&RangeAggregate> {
        let mut ranges: Vec<&RangeAggregate> = self.ranges.values().collect();
        ranges.sort_by(|a, b| {
            b.total_calls
                .cmp(&a.total_calls)
                .then(b.active_cli_count.cmp(&a.active_cli_count))
                .then(a.name.cmp(&b.name))
        });
        ranges
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Poisoned("memory store".to_string()))
    }
}

impl AggregateStore for MemoryStore {
    fn filter_unseen(&self, fingerprints: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.lock()?;
        Ok(fingerprints
            .iter()
            .filter(|fp| !inner.history.contains_key(*fp))
            .cloned()
            .collect())
    }

    fn apply_batch(
        &self,
        new_records: &[NormalizedRecord],
        all_records: &[NormalizedRecord],
        now_ms: i64,
    ) -> Result<BatchSummary, StoreError> {
        let mut inner = self.lock()?;
        let mut summary = BatchSummary::default();
        let mut touched = BTreeSet::new();

        for rec in new_records {
            if inner.history.contains_key(&rec.fingerprint) {
                continue;
            }
            inner.history.insert(rec.fingerprint.clone(), now_ms);

            let range = inner
                .ranges
                .entry(rec.range.clone())
                .or_insert_with(|| RangeAggregate {
                    name: rec.range.clone(),
                    source_key: rec.source_key.clone(),
                    total_calls: 0,
                    active_cli_count: 0,
                    last_seen_at_ms: rec.observed_at_ms,
                });
            range.total_calls += 1;
            range.last_seen_at_ms = range.last_seen_at_ms.max(rec.observed_at_ms);

            let cli = inner
                .clis
                .entry((rec.range.clone(), rec.cli.clone()))
                .or_insert_with(|| CliAggregate {
                    range: rec.range.clone(),
                    cli: rec.cli.clone(),
                    call_count: 0,
                    last_seen_at_ms: rec.observed_at_ms,
                });
            cli.call_count += 1;
            cli.last_seen_at_ms = cli.last_seen_at_ms.max(rec.observed_at_ms);

            summary.counted += 1;
            touched.insert(rec.range.clone());
        }

        for rec in all_records {
            if let Some(range) = inner.ranges.get_mut(&rec.range) {
                if range.last_seen_at_ms < rec.observed_at_ms {
                    range.last_seen_at_ms = rec.observed_at_ms;
                    summary.recency_updates += 1;
                }
            }
        }

        for range in &touched {
            inner.recount_clis(range);
        }

        summary.ranges_touched = touched.len();
        Ok(summary)
    }

    fn top_ranges(&self, limit: usize) -> Result<Vec<RangeView>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .ranked()
            .into_iter()
            .take(limit)
            .map(|agg| inner.view(agg))
            .collect())
    }

    fn search_ranges(&self, keyword: &str, limit: usize) -> Result<Vec<RangeView>, StoreError> {
        let inner = self.lock()?;
        let keyword_lower = keyword.trim().to_lowercase();
        Ok(inner
            .ranked()
            .into_iter()
            .map(|agg| inner.view(agg))
            .filter(|view| matches_keyword(view, &keyword_lower))
            .take(limit)
            .collect())
    }

    fn sweep(&self, cutoff_ms: i64) -> Result<SweepReport, StoreError> {
        let mut inner = self.lock()?;
        let mut report = SweepReport::default();

        let before = inner.history.len();
        inner.history.retain(|_, first_seen| *first_seen >= cutoff_ms);
        report.history_pruned = before - inner.history.len();

        let before = inner.clis.len();
        inner.clis.retain(|_, cli| cli.last_seen_at_ms >= cutoff_ms);
        report.clis_pruned = before - inner.clis.len();

        let before = inner.ranges.len();
        inner
            .ranges
            .retain(|_, r| r.last_seen_at_ms >= cutoff_ms && r.total_calls > 0);
        report.ranges_pruned = before - inner.ranges.len();

        let live: HashSet<String> = inner.ranges.keys().cloned().collect();
        let before = inner.clis.len();
        inner.clis.retain(|(range, _), _| live.contains(range));
        report.orphan_clis_pruned = before - inner.clis.len();

        if report.clis_pruned > 0 {
            for range in live {
                inner.recount_clis(&range);
            }
        }

        Ok(report)
    }

    fn range(&self, name: &str) -> Result<Option<RangeAggregate>, StoreError> {
        Ok(self.lock()?.ranges.get(name).cloned())
    }

    fn clis_for_range(&self, name: &str) -> Result<Vec<CliAggregate>, StoreError> {
        let inner = self.lock()?;
        let mut clis: Vec<CliAggregate> = inner
            .clis
            .values()
            .filter(|c| c.range == name)
            .cloned()
            .collect();
        clis.sort_by(|a, b| b.last_seen_at_ms.cmp(&a.last_seen_at_ms).then(a.cli.cmp(&b.cli)));
        Ok(clis)
    }

    fn history_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.history.len())
    }
}

impl BlacklistStore for MemoryStore {
    fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        Ok(self.lock()?.blacklist.values().cloned().collect())
    }

    fn save_blacklist_entry(&self, entry: &BlacklistEntry, _now_ms: i64) -> Result<(), StoreError> {
        self.lock()?
            .blacklist
            .insert(entry.source_key.clone(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalizer::fingerprint_at;

    fn record(range: &str, cli: &str, observed_at_ms: i64) -> NormalizedRecord {
        NormalizedRecord {
            range: range.to_string(),
            call: "555".to_string(),
            cli: cli.to_string(),
            source_key: "Kenya".to_string(),
            observed_at_ms,
            age_seconds: 0,
            fingerprint: fingerprint_at(range, "555", cli, observed_at_ms / 1000),
        }
    }

    #[test]
    fn test_apply_and_sweep_match_sqlite_semantics() {
        let store = MemoryStore::new();
        let a = record("R1", "1", 1_000_000);
        let b = record("R1", "2", 1_400_000);
        store.apply_batch(&[a.clone()], &[a.clone()], 1_000_000).unwrap();
        store.apply_batch(&[a.clone(), b.clone()], &[a, b], 1_400_000).unwrap();

        let r1 = store.range("R1").unwrap().unwrap();
        assert_eq!(r1.total_calls, 2);
        assert_eq!(r1.active_cli_count, 2);
        assert_eq!(r1.last_seen_at_ms, 1_400_000);

        let report = store.sweep(1_200_000).unwrap();
        assert_eq!(report.history_pruned, 1);
        assert_eq!(report.clis_pruned, 1);
        assert_eq!(report.ranges_pruned, 0);

        let r1 = store.range("R1").unwrap().unwrap();
        assert_eq!(r1.total_calls, 2);
        assert_eq!(r1.active_cli_count, 1);
    }

    #[test]
    fn test_search_empty_keyword_matches_all() {
        let store = MemoryStore::new();
        let recs = vec![record("R1", "1", 1_000), record("R2", "1", 1_000)];
        store.apply_batch(&recs, &recs, 1_000).unwrap();
        assert_eq!(store.search_ranges("", 10).unwrap().len(), 2);
        assert_eq!(store.search_ranges("kEnYa", 1).unwrap().len(), 1);
    }
}
