//! Session lifecycle manager
//!
//! State machine:
//!
//! ```text
//! Unauthenticated ─> Authenticating ─> Valid ─> Refreshing ─> Valid
//!                                                    ├──────> Retrying (backoff) ─> Refreshing
//!                                                    └──────> Failed (cooldown) ─> Authenticating
//! ```
//!
//! While a scheduled cycle is backing off or cooling down, fetch-triggered
//! refreshes fail fast with `CoolingDown` instead of starting their own login.
//!
//! Refresh is single-flight: the first caller spawns the login and parks a
//! shared handle in `in_flight`; everyone else arriving before it completes
//! awaits that same handle. The slot is cleared when the login settles.

use super::credentials::CredentialStore;
use super::login::LoginProvider;
use super::retry::RetryPolicy;
use super::{AuthSession, SessionError};
use crate::now_millis;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

/// Notified after every successful credential swap
pub trait SessionListener: Send + Sync {
    fn on_session_refreshed(&self, session: &AuthSession);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Valid,
    Refreshing,
    /// Scheduled refresh failed; next attempt of the cycle at `next_at_ms`
    Retrying { next_at_ms: i64 },
    /// Retry cycle exhausted; next scheduled attempt at `retry_at_ms`
    Failed { retry_at_ms: i64 },
}

type SharedRefresh = Shared<BoxFuture<'static, Result<AuthSession, SessionError>>>;

pub struct SessionManager {
    login: Arc<dyn LoginProvider>,
    credentials: Arc<dyn CredentialStore>,
    policy: RetryPolicy,
    refresh_interval: Duration,
    login_timeout: Duration,
    current: RwLock<Option<AuthSession>>,
    state: Mutex<SessionState>,
    status: Mutex<String>,
    in_flight: tokio::sync::Mutex<Option<SharedRefresh>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    reschedule: Notify,
    logins_started: AtomicU64,
}

impl SessionManager {
    pub fn new(
        login: Arc<dyn LoginProvider>,
        credentials: Arc<dyn CredentialStore>,
        policy: RetryPolicy,
        refresh_interval: Duration,
        login_timeout: Duration,
    ) -> Self {
        Self {
            login,
            credentials,
            policy,
            refresh_interval,
            login_timeout,
            current: RwLock::new(None),
            state: Mutex::new(SessionState::Unauthenticated),
            status: Mutex::new("Not logged in".to_string()),
            in_flight: tokio::sync::Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            reschedule: Notify::new(),
            logins_started: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Current credential without triggering a refresh
    pub fn current(&self) -> Option<AuthSession> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Human-readable status for the status reporter
    pub fn status(&self) -> String {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of login operations started since construction
    pub fn logins_started(&self) -> u64 {
        self.logins_started.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.into();
    }

    /// Install a previously persisted token pair if it is still inside its
    /// refresh interval
    ///
    /// A stored pair without an issuance time is treated as issued at `now_ms`.
    pub fn restore(&self, now_ms: i64) -> Result<Option<AuthSession>, SessionError> {
        let stored = match self.credentials.load()? {
            Some(stored) => stored,
            None => return Ok(None),
        };

        let issued_at_ms = stored.issued_at_ms.unwrap_or(now_ms);
        let due_at_ms = issued_at_ms + self.refresh_interval.as_millis() as i64;
        if due_at_ms <= now_ms {
            log::info!("🔑 Stored session is past its refresh time, will log in on first use");
            return Ok(None);
        }

        let session = AuthSession {
            session_token: stored.session_token,
            csrf_token: stored.csrf_token,
            issued_at_ms,
        };

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        self.set_state(SessionState::Valid);
        self.set_status("Session restored");

        log::info!("✅ Restored stored session");
        log::info!("   └─ Next refresh in {}s", (due_at_ms - now_ms) / 1000);
        Ok(Some(session))
    }

    /// Return the current credential, logging in first if there is none
    pub async fn ensure_valid_session(self: &Arc<Self>) -> Result<AuthSession, SessionError> {
        if let Some(session) = self.current() {
            return Ok(session);
        }
        self.refresh_on_demand(|_| true).await
    }

    /// Refresh because `rejected` was bounced by the portal
    ///
    /// If another refresh already replaced `rejected`, the newer credential is
    /// returned without logging in again.
    pub async fn refresh_after_rejection(
        self: &Arc<Self>,
        rejected: &AuthSession,
        reason: &str,
    ) -> Result<AuthSession, SessionError> {
        if let Some(current) = self.current() {
            if current != *rejected {
                log::debug!("Rejected credential already replaced, reusing current session");
                return Ok(current);
            }
        }

        self.set_status(format!("Session expired ({})", reason));
        log::warn!("🔒 Session rejected by portal ({}), refreshing", reason);
        self.refresh_on_demand(|current| current != rejected).await
    }

    async fn refresh_on_demand(
        self: &Arc<Self>,
        reusable: impl FnOnce(&AuthSession) -> bool,
    ) -> Result<AuthSession, SessionError> {
        match self.state() {
            SessionState::Retrying { .. } | SessionState::Failed { .. } => {
                Err(SessionError::CoolingDown)
            }
            _ => self.single_flight(reusable).await,
        }
    }

    /// Log in and install a new credential (single-flight)
    pub async fn force_refresh(self: &Arc<Self>) -> Result<AuthSession, SessionError> {
        self.single_flight(|_| false).await
    }

    /// Join the in-flight login, or start one unless the current credential
    /// passes `reusable` (checked under the slot lock, so a login that
    /// finished while this caller was queued is not repeated)
    async fn single_flight(
        self: &Arc<Self>,
        reusable: impl FnOnce(&AuthSession) -> bool,
    ) -> Result<AuthSession, SessionError> {
        let refresh = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(refresh) if refresh.peek().is_none() => refresh.clone(),
                _ => {
                    if let Some(current) = self.current().filter(reusable) {
                        return Ok(current);
                    }

                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let result = this.login_once().await;
                        this.in_flight.lock().await.take();
                        result
                    });

                    let refresh: SharedRefresh = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(SessionError::Login(format!("refresh task aborted: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();

                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    async fn login_once(&self) -> Result<AuthSession, SessionError> {
        let previous = self.current();
        let prior_state = self.state();
        self.set_state(if previous.is_some() {
            SessionState::Refreshing
        } else {
            SessionState::Authenticating
        });
        self.set_status("Refreshing tokens");
        self.logins_started.fetch_add(1, Ordering::Relaxed);

        log::info!("🔑 Logging in to portal...");

        let tokens = match timeout(self.login_timeout, self.login.login()).await {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => return Err(self.login_failed(&prior_state, previous.is_some(), e)),
            Err(_) => {
                let err = SessionError::LoginTimeout(self.login_timeout.as_millis() as u64);
                return Err(self.login_failed(&prior_state, previous.is_some(), err));
            }
        };

        let session = AuthSession {
            session_token: tokens.session_token,
            csrf_token: tokens.csrf_token,
            issued_at_ms: now_millis(),
        };

        // Durable first: a failed write leaves the old credential in place
        if let Err(e) = self.credentials.save(&session) {
            return Err(self.login_failed(&prior_state, previous.is_some(), e));
        }

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        self.set_state(SessionState::Valid);
        self.set_status("Tokens refreshed");

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_session_refreshed(&session);
        }
        self.reschedule.notify_one();

        log::info!("✅ Session refreshed");
        log::info!("   └─ Next refresh in {}s", self.refresh_interval.as_secs());
        Ok(session)
    }

    fn login_failed(&self, prior: &SessionState, had_session: bool, err: SessionError) -> SessionError {
        // A failed retry keeps the cycle's hold until the cycle moves on
        self.set_state(match prior {
            SessionState::Retrying { .. } | SessionState::Failed { .. } => prior.clone(),
            _ if had_session => SessionState::Valid,
            _ => SessionState::Unauthenticated,
        });
        self.set_status("Login failed");
        log::error!("❌ {}", err);
        err
    }

    /// Time until the current credential is due for refresh (zero if none)
    pub fn time_until_refresh(&self, now_ms: i64) -> Duration {
        match self.current() {
            None => Duration::ZERO,
            Some(session) => {
                let due_at_ms = session.issued_at_ms + self.refresh_interval.as_millis() as i64;
                Duration::from_millis((due_at_ms - now_ms).max(0) as u64)
            }
        }
    }

    /// Refresh until a login succeeds
    ///
    /// Failures back off per the retry policy (`Retrying`); an exhausted cycle
    /// enters `Failed` for the cooldown period and then starts over. Never
    /// gives up. A credential installed by someone else while waiting ends
    /// the cycle without another login.
    pub async fn refresh_with_retry(self: &Arc<Self>) -> AuthSession {
        let mut backoff = self.policy.backoff();
        let stale = self.current();

        loop {
            match self.force_refresh().await {
                Ok(session) => return session,
                Err(e) => {
                    log::warn!("⚠️  Scheduled refresh failed: {}", e);

                    if let Some(delay) = backoff.next_delay() {
                        self.set_state(SessionState::Retrying {
                            next_at_ms: now_millis() + delay.as_millis() as i64,
                        });
                        self.set_status(format!("Login failed, retrying in {}s", delay.as_secs()));
                    }

                    if backoff.sleep().await.is_err() {
                        let cooldown = self.policy.cooldown;
                        self.set_state(SessionState::Failed {
                            retry_at_ms: now_millis() + cooldown.as_millis() as i64,
                        });
                        self.set_status(format!("Login failed, retrying in {}s", cooldown.as_secs()));
                        log::error!(
                            "❌ Session refresh failed {} times, cooling down for {}s",
                            self.policy.max_retries + 1,
                            cooldown.as_secs()
                        );

                        sleep(cooldown).await;
                        backoff.reset();
                    }

                    if let Some(current) = self.current().filter(|c| Some(c) != stale.as_ref()) {
                        log::info!("✅ Session replaced during backoff, ending retry cycle");
                        return current;
                    }
                }
            }
        }
    }

    /// Timer loop: refresh at `issued_at + refresh_interval`
    ///
    /// Any out-of-band refresh re-arms the timer relative to the new
    /// issuance time.
    pub async fn run_refresh_schedule(self: Arc<Self>) {
        log::info!(
            "⏰ Session refresh scheduler started (interval: {}s)",
            self.refresh_interval.as_secs()
        );

        loop {
            let wait = self.time_until_refresh(now_millis());
            if !wait.is_zero() {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = self.reschedule.notified() => continue,
                }
            }

            log::info!("⏰ Scheduled session refresh");
            self.refresh_with_retry().await;
        }
    }
}
