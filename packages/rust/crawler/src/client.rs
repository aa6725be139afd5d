//! Budgeted, rate-limited catalog API client.
//!
//! Every issued HTTP call, retries included, is charged to a [`RunBudget`].
//! A sliding [`RateWindow`] bounds calls per period, and transient failures
//! back off exponentially under a [`RetryPolicy`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use samplegraph_shared::{ApiConfig, ApiError, ItemId, Result, SampleGraphError, read_secret};

use crate::catalog::{FIELDS, ItemPayload, SearchPage};

/// User-Agent string for catalog requests.
const USER_AGENT: &str = concat!("SampleGraph/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Raw HTTP exchange result. Non-2xx statuses are responses, not errors.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// The HTTP layer underneath [`ApiClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue `GET endpoint?query`. `Err` means no response was received.
    async fn get(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> std::result::Result<TransportResponse, String>;
}

/// `reqwest` transport with token authentication.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| SampleGraphError::config(format!("invalid api base_url: {e}")))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| SampleGraphError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> std::result::Result<TransportResponse, String> {
        let url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| format!("invalid endpoint {endpoint}: {e}"))?;

        let mut request = self.client.get(url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Token {key}"));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.map_err(|e| e.to_string())?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Budget, rate window, retry policy
// ---------------------------------------------------------------------------

/// Per-run request ceiling. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    max_requests: u32,
    requests_made: u32,
}

impl RunBudget {
    pub fn new(max_requests: u32) -> Self {
        Self {
            max_requests,
            requests_made: 0,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn requests_made(&self) -> u32 {
        self.requests_made
    }

    pub fn requests_remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.requests_made)
    }

    pub fn is_exhausted(&self) -> bool {
        self.requests_remaining() == 0
    }

    fn charge(&mut self) {
        self.requests_made += 1;
    }
}

/// Sliding window of recent call instants.
#[derive(Debug, Clone)]
pub struct RateWindow {
    limit: usize,
    period: Duration,
    calls: VecDeque<Instant>,
}

impl RateWindow {
    /// At most `limit` calls in any `period`. A zero limit disables throttling.
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit: limit as usize,
            period,
            calls: VecDeque::new(),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Wait until a call may be issued, then record it.
    pub async fn acquire(&mut self) {
        if self.limit == 0 {
            return;
        }
        loop {
            let now = Instant::now();
            while let Some(&oldest) = self.calls.front() {
                if now.duration_since(oldest) >= self.period {
                    self.calls.pop_front();
                } else {
                    break;
                }
            }

            if self.calls.len() < self.limit {
                self.calls.push_back(now);
                return;
            }

            if let Some(&oldest) = self.calls.front() {
                let ready_at = oldest + self.period;
                debug!(
                    wait_ms = ready_at.saturating_duration_since(now).as_millis() as u64,
                    "rate window full, waiting"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }

    pub fn in_window(&self) -> usize {
        self.calls.len()
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`; `Retry-After` overrides the
    /// computed value but is still capped.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        retry_after.unwrap_or(computed).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&ApiConfig> for RetryPolicy {
    fn from(api: &ApiConfig) -> Self {
        Self {
            max_attempts: api.max_attempts.max(1),
            base_delay: Duration::from_millis(api.base_delay_ms),
            max_delay: Duration::from_millis(api.max_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// Catalog client owned by the crawl loop.
///
/// Methods take `&mut self` so budget and window updates are ordered with
/// issuance.
pub struct ApiClient {
    transport: Box<dyn Transport>,
    budget: RunBudget,
    window: RateWindow,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        transport: Box<dyn Transport>,
        budget: RunBudget,
        window: RateWindow,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            budget,
            window,
            retry,
        }
    }

    /// HTTP client from `[api]`, reading the key from its env var when set.
    pub fn from_config(api: &ApiConfig, max_requests: u32) -> Result<Self> {
        let api_key = match read_secret(&api.api_key_env) {
            Ok(key) => Some(key),
            Err(_) => {
                warn!(var = %api.api_key_env, "catalog API key not set; requests are unauthenticated");
                None
            }
        };
        let transport = HttpTransport::new(
            &api.base_url,
            api_key,
            Duration::from_secs(api.timeout_secs),
        )?;
        Ok(Self::new(
            Box::new(transport),
            RunBudget::new(max_requests),
            RateWindow::per_minute(api.requests_per_minute),
            RetryPolicy::from(api),
        ))
    }

    pub fn budget(&self) -> RunBudget {
        self.budget
    }

    pub fn requests_made(&self) -> u32 {
        self.budget.requests_made()
    }

    pub fn requests_remaining(&self) -> u32 {
        self.budget.requests_remaining()
    }

    /// Issue a budgeted GET and decode the JSON body.
    pub async fn fetch(
        &mut self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<Value, ApiError> {
        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_status = None;
        let mut last_message = String::new();

        for attempt in 0..max_attempts {
            if self.budget.is_exhausted() {
                return Err(ApiError::BudgetExhausted {
                    requests_made: self.budget.requests_made(),
                });
            }

            self.window.acquire().await;
            self.budget.charge();

            let retry_after = match self.transport.get(endpoint, &query).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    return serde_json::from_str(&response.body).map_err(|e| ApiError::Decode {
                        endpoint: endpoint.to_string(),
                        message: e.to_string(),
                    });
                }
                Ok(response) if response.status == 429 || response.status >= 500 => {
                    last_status = Some(response.status);
                    last_message = truncate(&response.body);
                    response.retry_after
                }
                Ok(response) => {
                    return Err(ApiError::Permanent {
                        endpoint: endpoint.to_string(),
                        status: response.status,
                        message: truncate(&response.body),
                    });
                }
                Err(message) => {
                    last_status = None;
                    last_message = message;
                    None
                }
            };

            if attempt + 1 < max_attempts {
                let delay = self.retry.delay(attempt, retry_after);
                warn!(
                    endpoint,
                    attempt = attempt + 1,
                    status = ?last_status,
                    delay_ms = delay.as_millis() as u64,
                    "transient API failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(ApiError::Transient {
            endpoint: endpoint.to_string(),
            status: last_status,
            attempts: max_attempts,
            message: last_message,
        })
    }

    async fn fetch_as<T: DeserializeOwned>(
        &mut self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<T, ApiError> {
        let value = self.fetch(endpoint, params).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    /// `GET search/text/`.
    pub async fn search(
        &mut self,
        query: &str,
        sort: &str,
        page: u32,
        page_size: u32,
    ) -> std::result::Result<SearchPage, ApiError> {
        self.fetch_as(
            "search/text/",
            &[
                ("query", query.to_string()),
                ("sort", sort.to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
                ("fields", FIELDS.to_string()),
            ],
        )
        .await
    }

    /// `GET sounds/{id}/`.
    pub async fn item(&mut self, id: ItemId) -> std::result::Result<ItemPayload, ApiError> {
        self.fetch_as(&format!("sounds/{id}/"), &[("fields", FIELDS.to_string())])
            .await
    }

    /// `GET users/{name}/sounds/` (first page).
    pub async fn user_items(
        &mut self,
        username: &str,
        page_size: u32,
    ) -> std::result::Result<SearchPage, ApiError> {
        self.fetch_as(
            &format!("users/{username}/sounds/"),
            &[
                ("page_size", page_size.to_string()),
                ("fields", FIELDS.to_string()),
            ],
        )
        .await
    }

    /// `GET packs/{id}/sounds/` (first page).
    pub async fn pack_items(
        &mut self,
        pack_id: u64,
        page_size: u32,
    ) -> std::result::Result<SearchPage, ApiError> {
        self.fetch_as(
            &format!("packs/{pack_id}/sounds/"),
            &[
                ("page_size", page_size.to_string()),
                ("fields", FIELDS.to_string()),
            ],
        )
        .await
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------
