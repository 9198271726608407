//! Blacklist controller for unproductive query keys
//!
//! Rules per key:
//! - poll with ≥1 row: counter reset to 0
//! - empty poll: counter + 1, blacklisted once it reaches the threshold
//! - auth-failure poll: counter untouched
//!
//! While an authentication failure is outstanding (flag set by the scheduler,
//! cleared by the next successful session refresh) empty polls are not
//! counted either: an expired session can make every key look empty.

use super::store::{BlacklistStore, StoreError};
use super::types::{BlacklistEntry, FetchOutcome};
use crate::session::{AuthSession, SessionListener};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct BlacklistController {
    store: Arc<dyn BlacklistStore>,
    threshold: u32,
    entries: Mutex<HashMap<String, BlacklistEntry>>,
    auth_failure: AtomicBool,
}

impl BlacklistController {
    /// Build the controller from persisted state
    pub fn load(store: Arc<dyn BlacklistStore>, threshold: u32) -> Result<Self, StoreError> {
        let entries: HashMap<String, BlacklistEntry> = store
            .load_blacklist()?
            .into_iter()
            .map(|e| (e.source_key.clone(), e))
            .collect();

        let blacklisted = entries.values().filter(|e| e.blacklisted).count();
        if blacklisted > 0 {
            log::info!("🚫 Loaded {} blacklisted query keys", blacklisted);
        }

        Ok(Self {
            store,
            threshold,
            entries: Mutex::new(entries),
            auth_failure: AtomicBool::new(false),
        })
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, BlacklistEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Poisoned("blacklist".to_string()))
    }

    /// Record one poll outcome for `key`
    ///
    /// Returns `true` when this observation blacklisted the key.
    pub fn observe(&self, key: &str, outcome: &FetchOutcome, now_ms: i64) -> Result<bool, StoreError> {
        if outcome.auth_error {
            return Ok(false);
        }

        let empty = outcome.records.is_empty();
        if empty && self.auth_failure_pending() {
            log::debug!("Empty poll for {} ignored while session is being repaired", key);
            return Ok(false);
        }

        let mut entries = self.entries()?;
        let before = entries.get(key).cloned().unwrap_or_else(|| BlacklistEntry {
            source_key: key.to_string(),
            consecutive_empty_polls: 0,
            blacklisted: false,
        });

        let mut updated = before.clone();
        if empty {
            updated.consecutive_empty_polls = updated.consecutive_empty_polls.saturating_add(1);
            if updated.consecutive_empty_polls >= self.threshold {
                updated.blacklisted = true;
            }
        } else {
            updated.consecutive_empty_polls = 0;
            updated.blacklisted = false;
        }

        if updated == before {
            return Ok(false);
        }

        // Memory never runs ahead of the durable row
        self.store.save_blacklist_entry(&updated, now_ms)?;
        let newly_blacklisted = updated.blacklisted && !before.blacklisted;
        let snapshot = updated.clone();
        entries.insert(key.to_string(), updated);
        drop(entries);

        if newly_blacklisted {
            log::warn!(
                "🚫 Blacklisted {} after {} consecutive empty polls",
                key,
                snapshot.consecutive_empty_polls
            );
        }
        Ok(newly_blacklisted)
    }

    pub fn is_blacklisted(&self, key: &str) -> bool {
        self.entries()
            .map(|entries| entries.get(key).is_some_and(|e| e.blacklisted))
            .unwrap_or(false)
    }

    pub fn consecutive_empty(&self, key: &str) -> u32 {
        self.entries()
            .map(|entries| entries.get(key).map_or(0, |e| e.consecutive_empty_polls))
            .unwrap_or(0)
    }

    /// `universe` minus blacklisted keys, order preserved
    pub fn active_keys(&self, universe: &[String]) -> Vec<String> {
        match self.entries() {
            Ok(entries) => universe
                .iter()
                .filter(|k| !entries.get(k.as_str()).is_some_and(|e| e.blacklisted))
                .cloned()
                .collect(),
            Err(e) => {
                log::error!("❌ {}", e);
                universe.to_vec()
            }
        }
    }

    pub fn blacklisted_count(&self) -> usize {
        self.entries()
            .map(|entries| entries.values().filter(|e| e.blacklisted).count())
            .unwrap_or(0)
    }

    /// A fetch was bounced by the portal
    pub fn mark_auth_failure(&self) {
        self.auth_failure.store(true, Ordering::SeqCst);
    }

    pub fn auth_failure_pending(&self) -> bool {
        self.auth_failure.load(Ordering::SeqCst)
    }
}

impl SessionListener for BlacklistController {
    fn on_session_refreshed(&self, _session: &AuthSession) {
        self.auth_failure.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory_store::MemoryStore;
    use crate::pipeline::types::RawRecord;

    fn rows() -> FetchOutcome {
        FetchOutcome::with_records(vec![RawRecord {
            range: "R1".to_string(),
            call: "1".to_string(),
            cli: "2".to_string(),
            relative_age: "now".to_string(),
        }])
    }

    fn session() -> AuthSession {
        AuthSession {
            session_token: "s".to_string(),
            csrf_token: "c".to_string(),
            issued_at_ms: 0,
        }
    }

    #[test]
    fn test_blacklisted_at_threshold() {
        let store = Arc::new(MemoryStore::new());
        let controller = BlacklistController::load(store.clone(), 3).unwrap();

        assert!(!controller.observe("Niue", &FetchOutcome::empty(), 1).unwrap());
        assert!(!controller.observe("Niue", &FetchOutcome::empty(), 2).unwrap());
        assert!(controller.observe("Niue", &FetchOutcome::empty(), 3).unwrap());
        assert!(controller.is_blacklisted("Niue"));

        let universe = vec!["Kenya".to_string(), "Niue".to_string()];
        assert_eq!(controller.active_keys(&universe), vec!["Kenya".to_string()]);
        assert_eq!(controller.blacklisted_count(), 1);
    }

    #[test]
    fn test_records_reset_and_auth_errors_are_neutral() {
        let store = Arc::new(MemoryStore::new());
        let controller = BlacklistController::load(store, 10).unwrap();

        controller.observe("Kenya", &FetchOutcome::empty(), 1).unwrap();
        controller.observe("Kenya", &FetchOutcome::empty(), 2).unwrap();
        controller.observe("Kenya", &FetchOutcome::auth_failure(), 3).unwrap();
        assert_eq!(controller.consecutive_empty("Kenya"), 2);

        controller.observe("Kenya", &rows(), 4).unwrap();
        assert_eq!(controller.consecutive_empty("Kenya"), 0);
    }

    #[test]
    fn test_auth_window_suspends_counting() {
        let store = Arc::new(MemoryStore::new());
        let controller = BlacklistController::load(store, 10).unwrap();

        controller.mark_auth_failure();
        controller.observe("Kenya", &FetchOutcome::empty(), 1).unwrap();
        assert_eq!(controller.consecutive_empty("Kenya"), 0);

        controller.on_session_refreshed(&session());
        assert!(!controller.auth_failure_pending());
        controller.observe("Kenya", &FetchOutcome::empty(), 2).unwrap();
        assert_eq!(controller.consecutive_empty("Kenya"), 1);
    }

    /// Accepts writes until `fail` is set
    #[derive(Default)]
    struct FlakyStore {
        fail: AtomicBool,
        saved: Mutex<Vec<BlacklistEntry>>,
    }

    impl BlacklistStore for FlakyStore {
        fn load_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save_blacklist_entry(&self, entry: &BlacklistEntry, _now_ms: i64) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            let mut saved = self.saved.lock().unwrap();
            saved.retain(|e| e.source_key != entry.source_key);
            saved.push(entry.clone());
            Ok(())
        }
    }

    #[test]
    fn test_failed_save_leaves_counter_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let controller = BlacklistController::load(store.clone(), 2).unwrap();

        controller.observe("Niue", &FetchOutcome::empty(), 1).unwrap();
        assert_eq!(controller.consecutive_empty("Niue"), 1);

        store.fail.store(true, Ordering::SeqCst);
        assert!(controller.observe("Niue", &FetchOutcome::empty(), 2).is_err());
        assert_eq!(controller.consecutive_empty("Niue"), 1);
        assert!(!controller.is_blacklisted("Niue"));

        // Once writes recover the same poll count blacklists it
        store.fail.store(false, Ordering::SeqCst);
        assert!(controller.observe("Niue", &FetchOutcome::empty(), 3).unwrap());
        let reloaded = BlacklistController::load(store, 2).unwrap();
        assert!(reloaded.is_blacklisted("Niue"));
    }

    #[test]
    fn test_state_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        {
            let controller = BlacklistController::load(store.clone(), 2).unwrap();
            controller.observe("Niue", &FetchOutcome::empty(), 1).unwrap();
            controller.observe("Niue", &FetchOutcome::empty(), 2).unwrap();
            controller.observe("Tokelau", &FetchOutcome::empty(), 2).unwrap();
        }

        let reloaded = BlacklistController::load(store, 2).unwrap();
        assert!(reloaded.is_blacklisted("Niue"));
        assert!(!reloaded.is_blacklisted("Tokelau"));
        assert_eq!(reloaded.consecutive_empty("Tokelau"), 1);
    }
}
