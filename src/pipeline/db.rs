//! SQLite-backed store for history, aggregates and blacklist state
//!
//! One writer connection (batch pipeline + sweeper + blacklist) and one
//! reader connection (ranking queries, dedup lookups). With WAL the reader
//! only ever observes committed transactions and never waits on the writer.

use super::store::{
    matches_keyword, AggregateStore, BlacklistStore, StoreError, FINGERPRINT_CHUNK_SIZE,
    RECENT_CLI_LIMIT,
};
use super::types::{
    BatchSummary, BlacklistEntry, CliAggregate, NormalizedRecord, RangeAggregate, RangeView,
    SweepReport,
};
use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema files, applied in order. All use IF NOT EXISTS.
const SCHEMA_FILES: &[(&str, &str)] = &[
    ("00_call_history.sql", include_str!("../../sql/00_call_history.sql")),
    ("01_range_aggregates.sql", include_str!("../../sql/01_range_aggregates.sql")),
    ("02_cli_aggregates.sql", include_str!("../../sql/02_cli_aggregates.sql")),
    ("03_query_key_blacklist.sql", include_str!("../../sql/03_query_key_blacklist.sql")),
];

/// Run the embedded schema migrations
///
/// Idempotent: safe on every startup.
pub fn run_schema_migrations(conn: &Connection) -> Result<(), StoreError> {
    log::info!("🔧 Running schema migrations");

    for (filename, sql) in SCHEMA_FILES {
        log::debug!("   ├─ Executing: {}", filename);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ Schema ready ({} files)", SCHEMA_FILES.len());
    Ok(())
}

const RANGE_COLUMNS: &str = "name, source_key, total_calls, active_cli_count, last_seen_at";

fn range_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RangeAggregate> {
    Ok(RangeAggregate {
        name: row.get(0)?,
        source_key: row.get(1)?,
        total_calls: row.get(2)?,
        active_cli_count: row.get(3)?,
        last_seen_at_ms: row.get(4)?,
    })
}

fn lock<'a>(conn: &'a Mutex<Connection>, role: &str) -> Result<MutexGuard<'a, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Poisoned(format!("{} connection", role)))
}

/// SQLite implementation of `AggregateStore` + `BlacklistStore`
#[derive(Clone)]
pub struct SqliteStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(db_path)?;
        apply_optimized_pragmas(&writer)?;
        run_schema_migrations(&writer)?;

        let reader = Connection::open(db_path)?;
        apply_optimized_pragmas(&reader)?;
        reader.pragma_update(None, "query_only", "ON")?;

        log::info!("✅ SQLite store opened: {}", db_path.display());

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Ranked ranges (optionally filtered) with recent CLIs attached
    fn ranked_views(
        &self,
        keyword: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RangeView>, StoreError> {
        let conn = lock(&self.reader, "reader")?;
        // One read transaction so ranges and their CLIs come from the same snapshot
        let tx = conn.unchecked_transaction()?;

        let ranges: Vec<RangeAggregate> = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {} FROM range_aggregates
                 ORDER BY total_calls DESC, active_cli_count DESC, name ASC",
                RANGE_COLUMNS
            ))?;
            let rows = stmt.query_map([], range_from_row)?;
            rows.collect::<Result<_, _>>()?
        };

        let keyword_lower = keyword.map(|k| k.trim().to_lowercase()).unwrap_or_default();
        let mut views = Vec::with_capacity(limit.min(ranges.len()));

        let mut recent_stmt = tx.prepare_cached(
            "SELECT cli FROM cli_aggregates
             WHERE range_name = ?1
             ORDER BY last_seen_at DESC, cli ASC
             LIMIT ?2",
        )?;

        for range in ranges {
            if views.len() >= limit {
                break;
            }
            let mut view = RangeView {
                name: range.name,
                source_key: range.source_key,
                calls: range.total_calls,
                cli_count: range.active_cli_count,
                last_seen_at_millis: range.last_seen_at_ms,
                recent_clis: Vec::new(),
            };
            if !matches_keyword(&view, &keyword_lower) {
                continue;
            }
            view.recent_clis = recent_stmt
                .query_map(params![view.name, RECENT_CLI_LIMIT as i64], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            views.push(view);
        }

        Ok(views)
    }
}

impl AggregateStore for SqliteStore {
    fn filter_unseen(&self, fingerprints: &[String]) -> Result<HashSet<String>, StoreError> {
        let mut unseen: HashSet<String> = fingerprints.iter().cloned().collect();
        if unseen.is_empty() {
            return Ok(unseen);
        }

        let conn = lock(&self.reader, "reader")?;
        for chunk in fingerprints.chunks(FINGERPRINT_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT fingerprint FROM call_history WHERE fingerprint IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let seen = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
            for fingerprint in seen {
                unseen.remove(&fingerprint?);
            }
        }

        Ok(unseen)
    }

    fn apply_batch(
        &self,
        new_records: &[NormalizedRecord],
        all_records: &[NormalizedRecord],
        now_ms: i64,
    ) -> Result<BatchSummary, StoreError> {
        let mut conn = lock(&self.writer, "writer")?;
        let tx = conn.transaction()?;
        let mut summary = BatchSummary::default();
        let mut touched: BTreeSet<&str> = BTreeSet::new();

        {
            let mut insert_history = tx.prepare_cached(
                "INSERT OR IGNORE INTO call_history (fingerprint, first_seen_at) VALUES (?1, ?2)",
            )?;
            let mut upsert_range = tx.prepare_cached(
                "INSERT INTO range_aggregates (name, source_key, total_calls, active_cli_count, last_seen_at)
                 VALUES (?1, ?2, 1, 0, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                     total_calls = total_calls + 1,
                     last_seen_at = max(last_seen_at, excluded.last_seen_at)",
            )?;
            let mut upsert_cli = tx.prepare_cached(
                "INSERT INTO cli_aggregates (range_name, cli, call_count, last_seen_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(range_name, cli) DO UPDATE SET
                     call_count = call_count + 1,
                     last_seen_at = max(last_seen_at, excluded.last_seen_at)",
            )?;

            for rec in new_records {
                // A fingerprint already in history is never recounted
                if insert_history.execute(params![rec.fingerprint, now_ms])? == 0 {
                    continue;
                }
                upsert_range.execute(params![rec.range, rec.source_key, rec.observed_at_ms])?;
                upsert_cli.execute(params![rec.range, rec.cli, rec.observed_at_ms])?;
                summary.counted += 1;
                touched.insert(rec.range.as_str());
            }

            let mut raise_recency = tx.prepare_cached(
                "UPDATE range_aggregates SET last_seen_at = ?2
                 WHERE name = ?1 AND last_seen_at < ?2",
            )?;
            for rec in all_records {
                summary.recency_updates += raise_recency.execute(params![rec.range, rec.observed_at_ms])?;
            }

            let mut recount_clis = tx.prepare_cached(
                "UPDATE range_aggregates
                 SET active_cli_count = (SELECT COUNT(*) FROM cli_aggregates WHERE range_name = ?1)
                 WHERE name = ?1",
            )?;
            for range in &touched {
                recount_clis.execute(params![range])?;
            }
        }

        tx.commit()?;
        summary.ranges_touched = touched.len();
        Ok(summary)
    }

    fn top_ranges(&self, limit: usize) -> Result<Vec<RangeView>, StoreError> {
        self.ranked_views(None, limit)
    }

    fn search_ranges(&self, keyword: &str, limit: usize) -> Result<Vec<RangeView>, StoreError> {
        self.ranked_views(Some(keyword.trim()), limit)
    }

    fn sweep(&self, cutoff_ms: i64) -> Result<SweepReport, StoreError> {
        let mut conn = lock(&self.writer, "writer")?;
        let tx = conn.transaction()?;

        let report = SweepReport {
            history_pruned: tx.execute("DELETE FROM call_history WHERE first_seen_at < ?1", params![cutoff_ms])?,
            clis_pruned: tx.execute("DELETE FROM cli_aggregates WHERE last_seen_at < ?1", params![cutoff_ms])?,
            ranges_pruned: tx.execute(
                "DELETE FROM range_aggregates WHERE last_seen_at < ?1 OR total_calls <= 0",
                params![cutoff_ms],
            )?,
            orphan_clis_pruned: tx.execute(
                "DELETE FROM cli_aggregates
                 WHERE range_name NOT IN (SELECT name FROM range_aggregates)",
                [],
            )?,
        };

        if report.clis_pruned > 0 {
            tx.execute(
                "UPDATE range_aggregates
                 SET active_cli_count = (
                     SELECT COUNT(*) FROM cli_aggregates c WHERE c.range_name = range_aggregates.name
                 )",
                [],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    fn range(&self, name: &str) -> Result<Option<RangeAggregate>, StoreError> {
        let conn = lock(&self.reader, "reader")?;
        let range = conn
            .query_row(
                &format!("SELECT {} FROM range_aggregates WHERE name = ?1", RANGE_COLUMNS),
                params![name],
                range_from_row,
            )
            .optional()?;
        Ok(range)
    }

    fn clis_for_range(&self, name: &str) -> Result<Vec<CliAggregate>, StoreError> {
        let conn = lock(&self.reader, "reader")?;
        let mut stmt = conn.prepare_cached(
            "SELECT range_name, cli, call_count, last_seen_at FROM cli_aggregates
             WHERE range_name = ?1 ORDER BY last_seen_at DESC, cli ASC",
        )?;
        let rows = stmt.query_map(params![name], |row| {
            Ok(CliAggregate {
                range: row.get(0)?,
                cli: row.get(1)?,
                call_count: row.get(2)?,
                last_seen_at_ms: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn history_len(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.reader, "reader")?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM call_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl BlacklistStore for SqliteStore {
    fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        let conn = lock(&self.reader, "reader")?;
        let mut stmt = conn.prepare(
            "SELECT source_key, consecutive_empty_polls, blacklisted FROM query_key_blacklist",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BlacklistEntry {
                source_key: row.get(0)?,
                consecutive_empty_polls: row.get(1)?,
                blacklisted: row.get::<_, i64>(2)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn save_blacklist_entry(&self, entry: &BlacklistEntry, now_ms: i64) -> Result<(), StoreError> {
        let conn = lock(&self.writer, "writer")?;
        conn.execute(
            "INSERT INTO query_key_blacklist (source_key, consecutive_empty_polls, blacklisted, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_key) DO UPDATE SET
                 consecutive_empty_polls = excluded.consecutive_empty_polls,
                 blacklisted = excluded.blacklisted,
                 updated_at = excluded.updated_at",
            params![
                entry.source_key,
                entry.consecutive_empty_polls,
                entry.blacklisted as i64,
                now_ms
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalizer::fingerprint_at;
    use tempfile::{tempdir, TempDir};

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("rangewatch.db")).unwrap();
        (dir, store)
    }

    fn record(range: &str, cli: &str, observed_at_ms: i64) -> NormalizedRecord {
        NormalizedRecord {
            range: range.to_string(),
            call: "555".to_string(),
            cli: cli.to_string(),
            source_key: "Nigeria".to_string(),
            observed_at_ms,
            age_seconds: 0,
            fingerprint: fingerprint_at(range, "555", cli, observed_at_ms / 1000),
        }
    }

    #[test]
    fn test_schema_migrations_idempotent() {
        let (dir, _store) = open_store();
        // Second open re-runs every schema file
        let reopened = SqliteStore::open(dir.path().join("rangewatch.db"));
        assert!(reopened.is_ok());
    }

    #[test]
    fn test_apply_batch_counts_new_fingerprints_once() {
        let (_dir, store) = open_store();
        let recs = vec![record("R1", "111", 1_000_000), record("R1", "222", 1_000_500)];

        let summary = store.apply_batch(&recs, &recs, 1_001_000).unwrap();
        assert_eq!(summary.counted, 2);
        assert_eq!(summary.ranges_touched, 1);

        // Same records again: history rejects them, nothing recounted
        let summary = store.apply_batch(&recs, &recs, 1_002_000).unwrap();
        assert_eq!(summary.counted, 0);

        let range = store.range("R1").unwrap().unwrap();
        assert_eq!(range.total_calls, 2);
        assert_eq!(range.active_cli_count, 2);
        assert_eq!(range.source_key, "Nigeria");
        assert_eq!(store.history_len().unwrap(), 2);
    }

    #[test]
    fn test_recency_raised_by_already_seen_records() {
        let (_dir, store) = open_store();
        let first = record("R1", "111", 1_000_000);
        store.apply_batch(&[first.clone()], &[first.clone()], 1_000_000).unwrap();

        // Re-confirmation: no new fingerprint, later observation time
        let mut again = first.clone();
        again.observed_at_ms = 1_030_000;
        let summary = store.apply_batch(&[], &[again], 1_030_000).unwrap();
        assert_eq!(summary.counted, 0);
        assert_eq!(summary.recency_updates, 1);

        let range = store.range("R1").unwrap().unwrap();
        assert_eq!(range.total_calls, 1);
        assert_eq!(range.last_seen_at_ms, 1_030_000);

        // An older observation never moves recency backwards
        let mut older = first;
        older.observed_at_ms = 900_000;
        store.apply_batch(&[], &[older], 1_040_000).unwrap();
        assert_eq!(store.range("R1").unwrap().unwrap().last_seen_at_ms, 1_030_000);
    }

    #[test]
    fn test_filter_unseen_chunks_large_lists() {
        let (_dir, store) = open_store();
        let recs: Vec<_> = (0..1_200).map(|i| record("R1", &i.to_string(), 1_000_000)).collect();
        store.apply_batch(&recs[..700], &recs[..700], 1_000_000).unwrap();

        let fingerprints: Vec<String> = recs.iter().map(|r| r.fingerprint.clone()).collect();
        let unseen = store.filter_unseen(&fingerprints).unwrap();
        assert_eq!(unseen.len(), 500);
        assert!(unseen.contains(&recs[1_199].fingerprint));
        assert!(!unseen.contains(&recs[0].fingerprint));
    }

    #[test]
    fn test_ranking_order_and_recent_clis() {
        let (_dir, store) = open_store();
        let recs = vec![
            record("Alpha", "1", 1_000_000),
            record("Beta", "1", 1_000_000),
            record("Beta", "2", 1_001_000),
            record("Gamma", "1", 1_000_000),
            record("Gamma", "2", 1_002_000),
            record("Gamma", "3", 1_003_000),
            record("Gamma", "4", 1_004_000),
        ];
        // Second Alpha call with the same CLI (different bucket)
        let mut alpha_again = record("Alpha", "1", 1_300_000);
        alpha_again.call = "556".to_string();
        alpha_again.fingerprint = fingerprint_at("Alpha", "556", "1", 1_300);

        let mut batch = recs.clone();
        batch.push(alpha_again);
        store.apply_batch(&batch, &batch, 1_300_000).unwrap();

        let top = store.top_ranges(10).unwrap();
        let names: Vec<_> = top.iter().map(|v| v.name.as_str()).collect();
        // Gamma 4 calls; Alpha 2 calls/1 cli; Beta 2 calls/2 clis
        assert_eq!(names, vec!["Gamma", "Beta", "Alpha"]);
        assert_eq!(top[0].recent_clis, vec!["4", "3", "2"]);
        assert_eq!(top[1].cli_count, 2);

        assert_eq!(store.top_ranges(1).unwrap().len(), 1);
    }

    #[test]
    fn test_search_is_case_insensitive_on_name_and_source() {
        let (_dir, store) = open_store();
        let mut kenya = record("SAFARICOM 2547", "1", 1_000_000);
        kenya.source_key = "Kenya".to_string();
        let nigeria = record("MTN 234", "1", 1_000_000);
        store
            .apply_batch(&[kenya.clone(), nigeria.clone()], &[kenya, nigeria], 1_000_000)
            .unwrap();

        let hits = store.search_ranges("safari", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_key, "Kenya");

        let hits = store.search_ranges("NIGER", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "MTN 234");

        assert!(store.search_ranges("nothing", 10).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_prunes_stale_rows_and_recounts_clis() {
        let (_dir, store) = open_store();
        let old = record("R1", "111", 1_000_000);
        let fresh = record("R1", "222", 1_400_000);
        let stale_range = record("R2", "333", 1_000_000);
        store.apply_batch(&[old.clone(), stale_range.clone()], &[old, stale_range], 1_000_000).unwrap();
        store.apply_batch(&[fresh.clone()], &[fresh], 1_400_000).unwrap();

        let report = store.sweep(1_200_000).unwrap();
        assert_eq!(report.history_pruned, 2);
        assert_eq!(report.clis_pruned, 2);
        assert_eq!(report.ranges_pruned, 1);

        let r1 = store.range("R1").unwrap().unwrap();
        assert_eq!(r1.total_calls, 2, "calls stay cumulative");
        assert_eq!(r1.active_cli_count, 1, "cli count follows retained rows");
        assert!(store.range("R2").unwrap().is_none());
        assert_eq!(store.history_len().unwrap(), 1);
    }

    #[test]
    fn test_sweep_removes_orphan_clis() {
        let (_dir, store) = open_store();
        let rec = record("R1", "111", 1_000_000);
        store.apply_batch(&[rec.clone()], &[rec], 1_000_000).unwrap();
        {
            let conn = store.writer.lock().unwrap();
            conn.execute(
                "INSERT INTO cli_aggregates (range_name, cli, call_count, last_seen_at) VALUES ('Ghost', '9', 1, 2000000)",
                [],
            )
            .unwrap();
        }

        let report = store.sweep(500_000).unwrap();
        assert_eq!(report.orphan_clis_pruned, 1);
        assert!(store.clis_for_range("Ghost").unwrap().is_empty());
    }

    #[test]
    fn test_blacklist_roundtrip() {
        let (dir, store) = open_store();
        let entry = BlacklistEntry {
            source_key: "Atlantis".to_string(),
            consecutive_empty_polls: 10,
            blacklisted: true,
        };
        store.save_blacklist_entry(&entry, 1_000).unwrap();

        let mut update = entry.clone();
        update.consecutive_empty_polls = 11;
        store.save_blacklist_entry(&update, 2_000).unwrap();

        // Survives reopen
        drop(store);
        let store = SqliteStore::open(dir.path().join("rangewatch.db")).unwrap();
        assert_eq!(store.load_blacklist().unwrap(), vec![update]);
    }
}
