//! HTTP transport to the tracker: REST and GraphQL with token auth and
//! rate-limit handling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use snafu::ResultExt as _;
use tracing::warn;

use crate::{GithubResult, HttpSnafu, LOG_TARGET, RateLimitedSnafu, StatusSnafu};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "oscar-bot/0.1";

/// Bounded retry: after this many rate-limit replies the error surfaces to
/// the outer sync loop, which will come back on its next cadence anyway.
const MAX_RATE_LIMIT_RETRIES: u32 = 4;
const MAX_RETRY_WAIT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl Client {
    pub fn new(token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            token,
        }
    }

    /// Point at a different API host. Test support and GitHub Enterprise.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    pub async fn get_json(&self, url: &str) -> GithubResult<Value> {
        self.execute(Method::GET, url, None).await
    }

    pub async fn post_json(&self, url: &str, body: &Value) -> GithubResult<Value> {
        self.execute(Method::POST, url, Some(body)).await
    }

    pub async fn patch_json(&self, url: &str, body: &Value) -> GithubResult<Value> {
        self.execute(Method::PATCH, url, Some(body)).await
    }

    pub async fn graphql(&self, query: &str, variables: Value) -> GithubResult<Value> {
        let url = self.api_url("/graphql");
        let body = serde_json::json!({ "query": query, "variables": variables });
        let response = self.execute(Method::POST, &url, Some(&body)).await?;
        if let Some(errors) = response.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                warn!(target: LOG_TARGET, errors = %serde_json::Value::Array(errors.clone()), "GraphQL query returned errors");
                return StatusSnafu { status: 200u16, url }.fail();
            }
        }
        Ok(response)
    }

    async fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> GithubResult<Value> {
        let mut attempts = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), url)
                .header(ACCEPT, "application/vnd.github+json");
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.context(HttpSnafu)?;
            let status = response.status();

            if is_rate_limited(status, response.headers()) {
                attempts += 1;
                if MAX_RATE_LIMIT_RETRIES < attempts {
                    return RateLimitedSnafu { url, attempts }.fail();
                }
                let wait = retry_hint(response.headers())
                    .unwrap_or_else(|| Duration::from_secs(2u64.pow(attempts)))
                    .min(MAX_RETRY_WAIT);
                warn!(
                    target: LOG_TARGET,
                    %url,
                    attempts,
                    wait_secs = wait.as_secs(),
                    "Rate limited, backing off"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                return StatusSnafu {
                    status: status.as_u16(),
                    url,
                }
                .fail();
            }

            return response.json().await.context(HttpSnafu);
        }
    }
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    // A 403 is a rate limit only when the reply says so; otherwise it's a
    // plain permission failure.
    status == StatusCode::FORBIDDEN
        && (headers.contains_key(RETRY_AFTER)
            || headers
                .get("x-ratelimit-remaining")
                .and_then(|value| value.to_str().ok())
                == Some("0"))
}

/// The upstream's retry hint: `Retry-After` seconds, or seconds until
/// `x-ratelimit-reset`.
fn retry_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now).max(1)))
}
