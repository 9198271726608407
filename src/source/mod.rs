//! Portal transport
//!
//! A `SourceProvider` turns one query key into the raw table rows the portal
//! currently shows for it. It never fails: transport problems come back as an
//! empty outcome, a bounced session as `auth_error`.

pub mod http;

pub use http::{parse_rows, HttpSourceProvider};

use crate::pipeline::types::FetchOutcome;
use crate::session::AuthSession;
use async_trait::async_trait;

#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, key: &str, session: &AuthSession) -> FetchOutcome;
}
