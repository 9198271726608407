//! Portal login
//!
//! The portal has no token API: a real browser must walk the login page,
//! enter the test account and trigger one search so the CSRF header shows up
//! on the wire. `BrowserlessLogin` runs that walk on a hosted Browserless
//! instance through its `/function` endpoint.

use super::SessionError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Token pair produced by one successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTokens {
    pub session_token: String,
    pub csrf_token: String,
}

#[async_trait]
pub trait LoginProvider: Send + Sync {
    async fn login(&self) -> Result<LoginTokens, SessionError>;
}

/// Puppeteer function executed remotely. Receives `context` from the request
/// body and returns the captured tokens as JSON.
const LOGIN_FUNCTION: &str = r#"
export default async function ({ page, context }) {
  let csrfToken = '';
  let sessionToken = '';

  await page.setUserAgent('Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36');
  await page.setViewport({ width: 1920, height: 1080 });
  await page.setRequestInterception(true);
  page.on('request', (request) => {
    if (request.url().includes(context.searchPath)) {
      const headers = request.headers();
      csrfToken = headers['x-csrf-token'] || csrfToken;
      const match = (headers['cookie'] || '').match(new RegExp(context.cookieName + '=([^;]+)'));
      if (match) sessionToken = match[1];
    }
    request.continue();
  });

  await page.goto(context.baseUrl + '/login', { waitUntil: 'networkidle2', timeout: 60000 });
  await Promise.all([
    page.waitForNavigation({ waitUntil: 'networkidle2', timeout: 60000 }),
    page.evaluate(() => {
      const link = Array.from(document.querySelectorAll('a'))
        .find((el) => el.textContent.toLowerCase().includes('test account'));
      if (link) link.click();
    }),
  ]);

  if (!page.url().includes('cli/access')) {
    await page.goto(context.baseUrl + '/testaccount/services/cli/access', { waitUntil: 'networkidle2', timeout: 60000 });
  }

  await page.addStyleTag({ content: '.popup-message { display: none !important; }' });
  await page.evaluate(() => {
    const el = document.querySelector('#CLI');
    if (el) {
      el.value = '000';
      el.dispatchEvent(new Event('input', { bubbles: true }));
    }
  });

  await Promise.all([
    page.waitForResponse((resp) => resp.url().includes(context.searchPath), { timeout: 60000 }),
    page.evaluate(() => {
      const btn = Array.from(document.querySelectorAll('button, input[type="submit"], a'))
        .find((b) => b.textContent && b.textContent.toLowerCase().includes('search'));
      if (btn) btn.click();
    }),
  ]);

  const cookies = await page.cookies();
  const cookie = cookies.find((c) => c.name === context.cookieName);
  if (cookie) sessionToken = cookie.value;

  return { data: { csrfToken, sessionToken }, type: 'application/json' };
}
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponse {
    #[serde(default)]
    csrf_token: String,
    #[serde(default)]
    session_token: String,
}

/// Login through a hosted headless browser
pub struct BrowserlessLogin {
    client: Client,
    endpoint: String,
    api_key: String,
    portal_url: String,
}

impl BrowserlessLogin {
    pub fn new(
        browserless_url: &str,
        api_key: &str,
        portal_url: &str,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Login(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/function", browserless_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            portal_url: portal_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LoginProvider for BrowserlessLogin {
    async fn login(&self) -> Result<LoginTokens, SessionError> {
        log::debug!("Calling Browserless function endpoint {}", self.endpoint);

        let body = json!({
            "code": LOGIN_FUNCTION,
            "context": {
                "baseUrl": self.portal_url,
                "searchPath": crate::source::http::SEARCH_PATH,
                "cookieName": crate::source::http::SESSION_COOKIE,
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("token", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Login(format!("Browserless request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SessionError::Login(format!(
                "Browserless returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: FunctionResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Login(format!("Malformed Browserless response: {}", e)))?;

        if parsed.session_token.is_empty() || parsed.csrf_token.is_empty() {
            return Err(SessionError::Login(
                "login flow finished without capturing both tokens".to_string(),
            ));
        }

        Ok(LoginTokens {
            session_token: parsed.session_token,
            csrf_token: parsed.csrf_token,
        })
    }
}
