//! rangewatch runtime
//!
//! Wires every component together and runs until CTRL+C:
//! - Opens the SQLite store (schema applied idempotently)
//! - Restores or obtains a portal session
//! - Spawns the fetch scheduler, refresh timer, retention sweeper and
//!   status reporter
//!
//! Usage:
//!   cargo run --release --bin rangewatch
//!
//! Configuration comes from the environment (a `.env` file is loaded first);
//! see `PipelineConfig::from_env` and `SessionConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use rangewatch::countries::{default_query_keys, load_query_keys};
use rangewatch::now_millis;
use rangewatch::pipeline::{
    stats::run_status_reporter, AggregateStore, BlacklistController, BlacklistStore,
    FetchScheduler, Ingestor, PipelineConfig, PollStats, RankingService, RetentionSweeper,
    SqliteStore,
};
use rangewatch::session::{BrowserlessLogin, EnvFileCredentialStore, SessionConfig, SessionManager};
use rangewatch::source::HttpSourceProvider;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // NOTE: Workaround for rustls issue
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("⚠️  rustls crypto provider already installed");
    }

    info!("🚀 Starting rangewatch");

    let config = PipelineConfig::from_env()?;
    let session_config = SessionConfig::from_env()?;

    let universe = match &config.query_keys_file {
        Some(path) => load_query_keys(path)?,
        None => default_query_keys(),
    };

    info!("📊 Configuration:");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Source: {}", config.source_base_url);
    info!("   ├─ Query keys: {}", universe.len());
    info!("   ├─ Batch size: {} (delay {}ms)", config.batch_size, config.batch_delay_ms);
    info!(
        "   ├─ Request timeout: {}ms (+{}ms grace)",
        config.request_timeout_ms, config.deadline_grace_ms
    );
    info!("   ├─ Staleness cutoff: {}s", config.staleness_cutoff_secs);
    info!(
        "   ├─ Retention: {}ms (sweep every {}ms)",
        config.retention_horizon_ms, config.sweep_interval_ms
    );
    info!("   ├─ Blacklist threshold: {} empty polls", config.blacklist_threshold);
    info!("   └─ Token refresh: every {}s", session_config.refresh_interval().as_secs());

    // Store
    info!("🔧 Opening database...");
    let sqlite = Arc::new(SqliteStore::open(&config.db_path)?);
    let store: Arc<dyn AggregateStore> = sqlite.clone();
    let blacklist_store: Arc<dyn BlacklistStore> = sqlite;
    info!("✅ Database ready");

    // Session
    let credentials = Arc::new(EnvFileCredentialStore::new(&session_config.credentials_path));
    let login = Arc::new(BrowserlessLogin::new(
        &session_config.browserless_url,
        &session_config.browserless_api_key,
        &config.source_base_url,
        session_config.login_timeout(),
    )?);
    let session = Arc::new(SessionManager::new(
        login,
        credentials,
        session_config.retry_policy(),
        session_config.refresh_interval(),
        session_config.login_timeout(),
    ));
    if let Err(e) = session.restore(now_millis()) {
        warn!("⚠️  Could not restore stored session: {}", e);
    }

    let blacklist = Arc::new(BlacklistController::load(
        blacklist_store,
        config.blacklist_threshold,
    )?);
    session.add_listener(blacklist.clone());

    let source = Arc::new(HttpSourceProvider::new(
        &config.source_base_url,
        config.request_timeout(),
    )?);
    let stats = Arc::new(PollStats::new());
    let ranking = RankingService::new(store.clone());

    info!("🚀 Spawning background tasks...");

    let refresh = tokio::spawn(session.clone().run_refresh_schedule());
    info!("   ├─ ✅ Session refresh timer");

    let sweeper = RetentionSweeper::new(
        store.clone(),
        config.retention_horizon_ms,
        Duration::from_millis(config.sweep_interval_ms),
    );
    let sweep = tokio::spawn(sweeper.run());
    info!("   ├─ ✅ Retention sweeper");

    let status = tokio::spawn(run_status_reporter(
        stats.clone(),
        session.clone(),
        ranking,
        Duration::from_millis(config.status_interval_ms),
    ));
    info!("   ├─ ✅ Status reporter");

    let scheduler = FetchScheduler::new(
        &config,
        universe,
        source,
        session,
        blacklist,
        Ingestor::new(store, config.staleness_cutoff_secs),
        stats,
    );
    let mut poll = tokio::spawn(scheduler.run());
    info!("   └─ ✅ Fetch scheduler");

    info!("🔄 Press CTRL+C to shutdown gracefully");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
        }
        result = &mut poll => {
            if let Err(e) = result {
                error!("❌ Fetch scheduler stopped: {}", e);
            }
        }
    }

    poll.abort();
    refresh.abort();
    sweep.abort();
    status.abort();

    info!("✅ rangewatch stopped");
    Ok(())
}
