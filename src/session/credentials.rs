//! Durable credential storage
//!
//! The token pair lives in a dotenv file next to the rest of the
//! configuration so a restart can pick up a still-valid session.

use super::{AuthSession, SessionError};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SESSION_TOKEN_KEY: &str = "ORANGE_CARRIER_SESSION";
pub const CSRF_TOKEN_KEY: &str = "X_CSRF_TOKEN";
pub const ISSUED_AT_KEY: &str = "LAST_TOKEN_REFRESH";

/// Token pair as found on disk; the issuance time may be missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub session_token: String,
    pub csrf_token: String,
    pub issued_at_ms: Option<i64>,
}

pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when no complete token pair is stored
    fn load(&self) -> Result<Option<StoredCredentials>, SessionError>;

    /// Must be durable before returning `Ok`
    fn save(&self, session: &AuthSession) -> Result<(), SessionError>;
}

/// Dotenv-file credential store
///
/// `save` rewrites only the three credential keys and keeps every other
/// line. The new content is written to a sibling temp file, synced to disk
/// and renamed over the original.
#[derive(Debug, Clone)]
pub struct EnvFileCredentialStore {
    path: PathBuf,
}

impl EnvFileCredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| ".env".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Replace or append `KEY=value` lines, preserving unrelated content
fn merge_env_content(existing: &str, updates: &[(&str, String)]) -> String {
    let mut written = vec![false; updates.len()];
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let key = line.split_once('=').map(|(k, _)| k.trim());
            match key.and_then(|k| updates.iter().position(|(u, _)| *u == k)) {
                Some(idx) => {
                    written[idx] = true;
                    format!("{}={}", updates[idx].0, updates[idx].1)
                }
                None => line.to_string(),
            }
        })
        .collect();

    for (idx, (key, value)) in updates.iter().enumerate() {
        if !written[idx] {
            lines.push(format!("{}={}", key, value));
        }
    }

    let mut content = lines.join("\n");
    content.push('\n');
    content
}

impl CredentialStore for EnvFileCredentialStore {
    fn load(&self) -> Result<Option<StoredCredentials>, SessionError> {
        if !self.path.exists() {
            log::info!("No credential file found: {}", self.path.display());
            return Ok(None);
        }

        let iter = dotenv::from_path_iter(&self.path)
            .map_err(|e| SessionError::Persist(format!("{}: {}", self.path.display(), e)))?;

        let mut session_token = None;
        let mut csrf_token = None;
        let mut issued_at_ms = None;

        for item in iter {
            let (key, value) =
                item.map_err(|e| SessionError::Persist(format!("{}: {}", self.path.display(), e)))?;
            match key.as_str() {
                SESSION_TOKEN_KEY => session_token = Some(value),
                CSRF_TOKEN_KEY => csrf_token = Some(value),
                ISSUED_AT_KEY => issued_at_ms = value.trim().parse::<i64>().ok(),
                _ => {}
            }
        }

        match (session_token, csrf_token) {
            (Some(session_token), Some(csrf_token))
                if !session_token.is_empty() && !csrf_token.is_empty() =>
            {
                Ok(Some(StoredCredentials {
                    session_token,
                    csrf_token,
                    issued_at_ms,
                }))
            }
            _ => Ok(None),
        }
    }

    fn save(&self, session: &AuthSession) -> Result<(), SessionError> {
        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(SessionError::Persist(e.to_string())),
        };

        let content = merge_env_content(
            &existing,
            &[
                (SESSION_TOKEN_KEY, session.session_token.clone()),
                (CSRF_TOKEN_KEY, session.csrf_token.clone()),
                (ISSUED_AT_KEY, session.issued_at_ms.to_string()),
            ],
        );

        let temp = self.temp_path();
        write_synced(&temp, content.as_bytes())
            .map_err(|e| SessionError::Persist(format!("{}: {}", temp.display(), e)))?;
        fs::rename(&temp, &self.path)
            .map_err(|e| SessionError::Persist(format!("{}: {}", self.path.display(), e)))?;

        log::debug!("Credentials written to {}", self.path.display());
        Ok(())
    }
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}
