//! Shared SQLite connection tuning
//!
//! Every connection opened by the store goes through `apply_optimized_pragmas`
//! so the writer and reader agree on journal mode.

use rusqlite::Connection;
use std::time::Duration;

/// Apply WAL journal + relaxed sync settings
///
/// - `journal_mode = WAL`: readers never block the writer
/// - `synchronous = NORMAL`: safe with WAL, far fewer fsyncs
/// - `temp_store = MEMORY`
/// - `mmap_size = 64MB`, `cache_size = -16000` (16MB)
/// - `wal_autocheckpoint = 1000` pages
/// - busy timeout 5s so the sweeper and the batch writer queue instead of failing
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 67_108_864i64)?;
    conn.pragma_update(None, "cache_size", -16_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1_000i64)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}
