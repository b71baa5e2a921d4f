//! HTTP JSON-RPC upstream client.

use crate::forward::Forwarder;
use crate::handler::RequestContext;
use crate::provider::ProviderKind;
use relay_core::normalize::normalize_value;
use relay_core::{JsonRpcRequest, JsonRpcResponse, RelayError};
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 1000;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// HTTP status codes to retry on.
    pub retry_on_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retry_on_status_codes: vec![429, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Create a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        std::cmp::min(backoff, self.max_backoff)
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status_codes.contains(&status)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// JSON-RPC endpoint; `None` when the environment did not provide one.
    pub url: Option<Url>,
    /// Where the URL was expected to come from, for diagnostics.
    pub url_env: Option<String>,
    pub token: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl UpstreamConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url: Some(url),
            url_env: None,
            token: None,
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Forwards JSON-RPC messages as HTTP POSTs to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    name: String,
    client: Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(name: impl Into<String>, config: UpstreamConfig) -> Result<Self, RelayError> {
        let mut headers = header::HeaderMap::new();

        if let Some(ref token) = config.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| {
                        RelayError::Internal("Invalid upstream token format".to_string())
                    })?,
            );
        }

        for (name, value) in &config.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RelayError::Internal(format!("Invalid header name: {}", name)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|_| RelayError::Internal(format!("Invalid value for header {}", name)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("mcp-relay/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> Option<&Url> {
        self.config.url.as_ref()
    }

    fn endpoint(&self) -> Result<&Url, RelayError> {
        self.config.url.as_ref().ok_or_else(|| {
            RelayError::NotConfigured(match &self.config.url_env {
                Some(var) => format!("upstream URL for {} (set {})", self.name, var),
                None => format!("upstream URL for {}", self.name),
            })
        })
    }

    /// Execute a request with retries.
    async fn execute_with_retry(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, RelayError> {
        let retry_config = &self.config.retry;
        let mut attempts = 0;

        loop {
            let request = request_builder
                .try_clone()
                .ok_or_else(|| RelayError::Internal("Request cannot be cloned".to_string()))?;

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();

                    if response.status().is_success() {
                        return Ok(response);
                    }

                    if attempts < retry_config.max_retries
                        && retry_config.should_retry_status(status)
                    {
                        let backoff = retry_config.backoff_for_attempt(attempts);
                        warn!(
                            upstream = %self.name,
                            status = status,
                            attempt = attempts + 1,
                            backoff_ms = backoff.as_millis(),
                            "Upstream request failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(RelayError::UpstreamStatus {
                        status,
                        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                    });
                }
                Err(e) if e.is_timeout() => return Err(RelayError::Timeout),
                Err(e) => {
                    if attempts < retry_config.max_retries && e.is_connect() {
                        let backoff = retry_config.backoff_for_attempt(attempts);
                        warn!(
                            upstream = %self.name,
                            attempt = attempts + 1,
                            backoff_ms = backoff.as_millis(),
                            error = %e,
                            "Upstream unreachable, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        continue;
                    }
                    return Err(RelayError::Upstream(e.to_string()));
                }
            }
        }
    }

    /// POST one message. Returns the decoded reply body, `None` when empty.
    pub async fn post(&self, message: &JsonRpcRequest) -> Result<Option<Value>, RelayError> {
        let url = self.endpoint()?;
        debug!(upstream = %self.name, method = %message.method, "POST upstream");

        let response = self
            .execute_with_retry(
                self.client
                    .post(url.clone())
                    .header(header::ACCEPT, "application/json, text/event-stream")
                    .json(message),
            )
            .await?;

        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout
            } else {
                RelayError::Upstream(e.to_string())
            }
        })?;

        if body.trim().is_empty() {
            return Ok(None);
        }
        if is_event_stream {
            return first_event_payload(&body).map(Some).ok_or_else(|| {
                RelayError::Internal(
                    "Upstream event stream carried no JSON-RPC message".to_string(),
                )
            });
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| RelayError::Internal(format!("Invalid JSON from upstream: {}", e)))
    }

    /// GET `<origin>/health` and return whatever JSON it reports.
    pub async fn probe_health(&self) -> Result<Value, RelayError> {
        let url = self
            .endpoint()?
            .join("/health")
            .map_err(|e| RelayError::Internal(format!("Invalid health URL: {}", e)))?;
        let response = self.execute_with_retry(self.client.get(url)).await?;
        response
            .json()
            .await
            .map_err(|e| RelayError::Upstream(format!("Invalid health response: {}", e)))
    }
}

// Some MCP upstreams answer a POST with a one-shot SSE body.
fn first_event_payload(body: &str) -> Option<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .find_map(|data| serde_json::from_str(data.trim()).ok())
}

#[async_trait::async_trait]
impl Forwarder for HttpUpstream {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn forward(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Result<Option<JsonRpcResponse>, RelayError> {
        let body = tokio::select! {
            body = self.post(&request) => body?,
            _ = ctx.connection.cancellation().cancelled() => return Err(RelayError::ConnectionLost),
        };

        match (request.id, body) {
            (None, _) => Ok(None),
            (Some(id), Some(body)) => Ok(Some(normalize_value(id, body))),
            (Some(_), None) => Err(RelayError::Internal(
                "Empty response from upstream".to_string(),
            )),
        }
    }
}
