//! End-to-end tests over the SQLite store
//!
//! Covers:
//! - Replay idempotence within the retention horizon
//! - Re-reported sighting inside one time bucket
//! - Blacklisting through the scheduler, with an interleaved auth failure
//! - Ranking order after a sweep
//! - Readers never observe a half-applied batch

use async_trait::async_trait;
use rangewatch::pipeline::store::AggregateStore;
use rangewatch::pipeline::types::{FetchOutcome, KeyOutcome, RawRecord};
use rangewatch::pipeline::{
    BlacklistController, FetchScheduler, Ingestor, PipelineConfig, PollStats, RankingService,
    RetentionSweeper, SqliteStore,
};
use rangewatch::session::{
    AuthSession, EnvFileCredentialStore, LoginProvider, LoginTokens, RetryPolicy, SessionError,
    SessionManager,
};
use rangewatch::source::SourceProvider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn open_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("rangewatch.db")).unwrap();
    (dir, Arc::new(store))
}

fn raw(range: &str, call: &str, cli: &str, age: &str) -> RawRecord {
    RawRecord {
        range: range.to_string(),
        call: call.to_string(),
        cli: cli.to_string(),
        relative_age: age.to_string(),
    }
}

fn polled(key: &str, rows: Vec<RawRecord>) -> KeyOutcome {
    KeyOutcome {
        key: key.to_string(),
        outcome: FetchOutcome::with_records(rows),
    }
}

#[test]
fn test_replay_within_horizon_counts_nothing() {
    let (_dir, store) = open_store();
    let ingestor = Ingestor::new(store.clone(), 300);
    let batch = vec![
        polled(
            "Kenya",
            vec![raw("KENYA 254", "254700", "4411", "10 sec"), raw("KENYA 254", "254700", "4412", "1 min")],
        ),
        polled("Ghana", vec![raw("GHANA 233", "233200", "9911", "just now")]),
    ];
    let poll = 1_700_000_040_000;

    let first = ingestor.ingest(&batch, poll).unwrap();
    assert_eq!(first.counted, 3);
    let history = store.history_len().unwrap();
    let totals: Vec<i64> = store.top_ranges(10).unwrap().iter().map(|v| v.calls).collect();

    let replay = ingestor.ingest(&batch, poll).unwrap();
    assert_eq!(replay.new_records, 0);
    assert_eq!(replay.counted, 0);
    assert_eq!(store.history_len().unwrap(), history);
    let after: Vec<i64> = store.top_ranges(10).unwrap().iter().map(|v| v.calls).collect();
    assert_eq!(after, totals);
}

#[test]
fn test_same_bucket_resighting() {
    let (_dir, store) = open_store();
    let ingestor = Ingestor::new(store.clone(), 300);

    // 60s into a 120s bucket: origin t-5s and t+10s-5s share the bucket
    let t0_secs = 120 * 14_166_667 + 60;
    let row = || vec![raw("R1", "555", "555", "5 sec")];

    ingestor.ingest(&[polled("Kenya", row())], t0_secs * 1000).unwrap();
    let second = ingestor
        .ingest(&[polled("Kenya", row())], (t0_secs + 10) * 1000)
        .unwrap();
    assert_eq!(second.counted, 0);
    assert_eq!(second.recency_updates, 1);

    let r1 = store.range("R1").unwrap().unwrap();
    assert_eq!(r1.total_calls, 1);
    assert_eq!(r1.active_cli_count, 1);
    assert_eq!(r1.last_seen_at_ms, (t0_secs + 10) * 1000 - 5000);
}

#[test]
fn test_ranking_after_sweep() {
    let (_dir, store) = open_store();
    let ingestor = Ingestor::new(store.clone(), 300);
    let t = 1_700_000_000_000;

    ingestor
        .ingest(
            &[polled(
                "Kenya",
                vec![
                    raw("A", "1", "10", "now"),
                    raw("A", "1", "11", "now"),
                    raw("B", "1", "10", "now"),
                    raw("B", "2", "10", "now"),
                    raw("C", "1", "10", "now"),
                ],
            )],
            t,
        )
        .unwrap();
    ingestor
        .ingest(&[polled("Ghana", vec![raw("D", "1", "10", "now")])], t + 400_000)
        .unwrap();

    let ranking = RankingService::new(store.clone());
    let names: Vec<String> = ranking.top_ranges(10).unwrap().into_iter().map(|v| v.name).collect();
    // A and B both have 2 calls; A wins on CLI count
    assert_eq!(names, vec!["A", "B", "C", "D"]);

    let sweeper = RetentionSweeper::new(store.clone(), 300_000, Duration::from_secs(60));
    let report = sweeper.sweep_once(t + 450_000).unwrap();
    assert_eq!(report.ranges_pruned, 3);

    let top = ranking.top_ranges(10).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].name, "D");
    assert!(top.iter().all(|v| v.calls > 0));
    assert!(top
        .windows(2)
        .all(|w| (w[0].calls, w[0].cli_count) >= (w[1].calls, w[1].cli_count)));
}

#[test]
fn test_readers_see_whole_batches() {
    let (_dir, store) = open_store();
    let writer_store = store.clone();

    let writer = std::thread::spawn(move || {
        let ingestor = Ingestor::new(writer_store, 300);
        for i in 0..50 {
            // Two fresh CLIs per batch, always for the same range
            let rows = vec![
                raw("R1", "1", &format!("a{}", i), "now"),
                raw("R1", "1", &format!("b{}", i), "now"),
            ];
            ingestor.ingest(&[polled("Kenya", rows)], 1_700_000_000_000).unwrap();
        }
    });

    for _ in 0..200 {
        if let Some(view) = store.top_ranges(1).unwrap().first() {
            assert_eq!(view.calls % 2, 0, "observed a partially applied batch");
            assert_eq!(view.cli_count, view.calls);
        }
    }

    writer.join().unwrap();
    assert_eq!(store.range("R1").unwrap().unwrap().total_calls, 100);
}

struct CountingLogin(AtomicUsize);

#[async_trait]
impl LoginProvider for CountingLogin {
    async fn login(&self) -> Result<LoginTokens, SessionError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LoginTokens {
            session_token: format!("sess-{}", n),
            csrf_token: format!("csrf-{}", n),
        })
    }
}

/// Kenya always has rows; Niue never does, and its Nth poll is bounced
struct ScriptedSource {
    polls: Mutex<HashMap<String, usize>>,
    reject_niue_poll: usize,
}

#[async_trait]
impl SourceProvider for ScriptedSource {
    async fn fetch(&self, key: &str, _session: &AuthSession) -> FetchOutcome {
        let n = {
            let mut polls = self.polls.lock().unwrap();
            let n = polls.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        match key {
            "Kenya" => FetchOutcome::with_records(vec![raw("KENYA 254", "1", &n.to_string(), "now")]),
            "Niue" if n == self.reject_niue_poll => FetchOutcome::auth_failure(),
            _ => FetchOutcome::empty(),
        }
    }
}

#[tokio::test]
async fn test_blacklist_through_scheduler() {
    let (dir, store) = open_store();
    let config = PipelineConfig {
        batch_size: 2,
        batch_delay_ms: 0,
        ..Default::default()
    };

    let login = Arc::new(CountingLogin(AtomicUsize::new(0)));
    let session = Arc::new(SessionManager::new(
        login.clone(),
        Arc::new(EnvFileCredentialStore::new(dir.path().join(".env"))),
        RetryPolicy::default(),
        Duration::from_secs(6600),
        Duration::from_secs(10),
    ));
    let blacklist = Arc::new(BlacklistController::load(store.clone(), config.blacklist_threshold).unwrap());
    session.add_listener(blacklist.clone());

    let source = Arc::new(ScriptedSource {
        polls: Mutex::new(HashMap::new()),
        reject_niue_poll: 5,
    });
    let mut scheduler = FetchScheduler::new(
        &config,
        vec!["Kenya".to_string(), "Niue".to_string()],
        source,
        session.clone(),
        blacklist.clone(),
        Ingestor::new(store.clone(), config.staleness_cutoff_secs),
        Arc::new(PollStats::new()),
    );

    // 10 polls of Niue: 9 empty + 1 bounced
    for poll in 1..=10 {
        let batch = scheduler.next_batch();
        assert_eq!(batch.len(), 2);
        scheduler.run_batch(&batch).await;
        if poll == 5 {
            assert_eq!(blacklist.consecutive_empty("Niue"), 4);
        }
    }
    assert_eq!(blacklist.consecutive_empty("Niue"), 9);
    assert!(!blacklist.is_blacklisted("Niue"));
    assert_eq!(login.0.load(Ordering::SeqCst), 2);

    // 10th empty poll
    let batch = scheduler.next_batch();
    let report = scheduler.run_batch(&batch).await;
    assert_eq!(report.newly_blacklisted, vec!["Niue".to_string()]);

    assert_eq!(scheduler.active_keys(), vec!["Kenya".to_string()]);
    assert_eq!(scheduler.next_batch(), vec!["Kenya".to_string()]);

    // Blacklist survives a restart
    let reloaded = BlacklistController::load(store.clone(), config.blacklist_threshold).unwrap();
    assert!(reloaded.is_blacklisted("Niue"));

    // Credentials from the refresh were persisted
    let env = std::fs::read_to_string(dir.path().join(".env")).unwrap();
    assert!(env.contains("ORANGE_CARRIER_SESSION=sess-2"));
}
