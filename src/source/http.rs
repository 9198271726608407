//! HTTP source provider for the portal's CLI access search

use super::SourceProvider;
use crate::pipeline::types::{FetchOutcome, RawRecord};
use crate::session::AuthSession;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, LOCATION};
use reqwest::{redirect, Client, StatusCode};
use std::sync::LazyLock;
use std::time::Duration;

/// Search endpoint, relative to the portal origin
pub const SEARCH_PATH: &str = "/testaccount/services/cli/access/get";

/// Name of the portal's session cookie
pub const SESSION_COOKIE: &str = "orange_carrier_session";

/// Body fragments that only appear on the login page
const LOGIN_MARKERS: &[&str] = &["Log in to Your IPRN Account", "login-form"];

/// Columns: range, call, (skipped), cli, (skipped), relative age
static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<tr[^>]*>\s*<td[^>]*>(.*?)</td>\s*<td[^>]*>(.*?)</td>\s*<td[^>]*>.*?</td>\s*<td[^>]*>(.*?)</td>\s*<td[^>]*>.*?</td>\s*<td[^>]*>(.*?)</td>",
    )
    .expect("valid regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

fn cell_text(raw: &str) -> String {
    TAG_RE
        .replace_all(raw, "")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Extract sighting rows from a search response body
pub fn parse_rows(body: &str) -> Vec<RawRecord> {
    ROW_RE
        .captures_iter(body)
        .map(|caps| RawRecord {
            range: cell_text(&caps[1]),
            call: cell_text(&caps[2]),
            cli: cell_text(&caps[3]),
            relative_age: cell_text(&caps[4]),
        })
        .filter(|r| !r.range.is_empty())
        .collect()
}

pub fn is_login_page(body: &str) -> bool {
    LOGIN_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Authentication failure reason derived from status + redirect target
fn auth_rejection(status: StatusCode, location: Option<&str>) -> Option<String> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(status.as_u16().to_string());
    }
    if status.is_redirection() && location.is_some_and(|loc| loc.contains("login")) {
        return Some(format!("{} to login", status.as_u16()));
    }
    None
}

pub struct HttpSourceProvider {
    client: Client,
    search_url: String,
}

impl HttpSourceProvider {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
        );
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));

        let client = Client::builder()
            .timeout(request_timeout)
            .redirect(redirect::Policy::none())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            search_url: format!("{}{}", base_url.trim_end_matches('/'), SEARCH_PATH),
        })
    }
}

#[async_trait]
impl SourceProvider for HttpSourceProvider {
    async fn fetch(&self, key: &str, session: &AuthSession) -> FetchOutcome {
        let response = match self
            .client
            .post(&self.search_url)
            .header("x-csrf-token", &session.csrf_token)
            .header(COOKIE, format!("{}={}", SESSION_COOKIE, session.session_token))
            .form(&[("q", key)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Fetch failed for {}: {}", key, e);
                return FetchOutcome::empty();
            }
        };

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(reason) = auth_rejection(status, location.as_deref()) {
            log::debug!("Auth rejected for {}: {}", key, reason);
            return FetchOutcome::auth_failure();
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                log::debug!("Failed to read body for {}: {}", key, e);
                return FetchOutcome::empty();
            }
        };

        if is_login_page(&body) {
            log::debug!("Login page served for {}", key);
            return FetchOutcome::auth_failure();
        }

        if !status.is_success() {
            log::debug!("HTTP {} for {}", status, key);
            return FetchOutcome::empty();
        }

        FetchOutcome::with_records(parse_rows(&body))
    }
}
