//! Authenticated session lifecycle
//!
//! The portal hands out a session cookie + CSRF token pair that expires
//! roughly every two hours. `SessionManager` owns the pair, refreshes it on a
//! timer or when a fetch gets bounced to the login page, and guarantees at
//! most one login is in flight at a time.

pub mod config;
pub mod credentials;
pub mod login;
pub mod manager;
pub mod retry;

pub use config::SessionConfig;
pub use credentials::{CredentialStore, EnvFileCredentialStore, StoredCredentials};
pub use login::{BrowserlessLogin, LoginProvider, LoginTokens};
pub use manager::{SessionListener, SessionManager, SessionState};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};

/// The process-wide credential. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub session_token: String,
    pub csrf_token: String,
    pub issued_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The login flow itself failed
    Login(String),
    /// The login flow did not finish within the configured timeout
    LoginTimeout(u64),
    /// New credentials could not be written; in-memory session unchanged
    Persist(String),
    /// Scheduled refresh exhausted its retries; on-demand refresh refused
    CoolingDown,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Login(msg) => write!(f, "Login failed: {}", msg),
            SessionError::LoginTimeout(ms) => write!(f, "Login timed out after {}ms", ms),
            SessionError::Persist(msg) => write!(f, "Failed to persist credentials: {}", msg),
            SessionError::CoolingDown => write!(f, "Session refresh cooling down"),
        }
    }
}

impl std::error::Error for SessionError {}
