use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

/* ============================= CONFIG ============================= */

const BODY_EXCERPT_LIMIT: usize = 240;

/// HTTP status codes worth retrying.
const TRANSIENT_CODES: &[u16] = &[408, 409, 425, 429, 500, 502, 503, 504];

/// Returns true if the response code is in the transient set.
pub fn is_transient(status: u16) -> bool {
    TRANSIENT_CODES.contains(&status)
}

/// Per-request settings resolved from loop service config.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub token: Option<String>,
    /// Total attempts, including the first. Always at least 1.
    pub retry_attempts: u32,
    /// Scaling factor: the k-th retry sleeps `backoff * k` seconds.
    pub retry_backoff_seconds: f64,
    pub connect_timeout: Duration,
    pub max_time: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            token: None,
            retry_attempts: 3,
            retry_backoff_seconds: 1.0,
            connect_timeout: Duration::from_secs(5),
            max_time: Duration::from_secs(30),
        }
    }
}

/// Sleep duration before the k-th retry (k starting at 1).
pub fn backoff_delay(backoff_seconds: f64, k: u32) -> Duration {
    Duration::from_secs_f64((backoff_seconds * k as f64).max(0.0))
}

/* ============================= RESULT TYPES ============================= */

/// Successful JSON response.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: u16,
    pub body: Value,
}

/// Terminal transport failure after retries are exhausted or a
/// non-transient code is observed.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    /// Last HTTP status observed, if the request got that far.
    pub status: Option<u16>,
    /// Truncated response body excerpt for diagnostics.
    pub excerpt: String,
    /// Attempts actually performed.
    pub attempts: u32,
    /// True when the response arrived but was not valid JSON.
    pub invalid_payload: bool,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(
                f,
                "request failed with status {} after {} attempt(s): {}",
                code, self.attempts, self.excerpt
            ),
            None => write!(
                f,
                "request failed without a response after {} attempt(s): {}",
                self.attempts, self.excerpt
            ),
        }
    }
}

impl std::error::Error for TransportFailure {}

/// Truncate a body for error reporting.
pub fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(BODY_EXCERPT_LIMIT).collect();
    format!("{cut}…")
}

/* ============================= CLIENT ============================= */

/// Retrying JSON request client for the sprite service transport.
///
/// Retries only on transient codes or outright transport failure; a
/// non-transient 4xx surfaces immediately. The k-th retry sleeps
/// `backoff * k` seconds.
pub struct TransportClient {
    client: reqwest::Client,
}

impl TransportClient {
    pub fn new(config: &RequestConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.max_time)
            .build()?;
        Ok(Self { client })
    }

    fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match token {
            Some(token) => req.bearer_auth(token).header("X-Ops-Token", token),
            None => req,
        }
    }

    /// Issue a JSON request with bounded retries.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        config: &RequestConfig,
    ) -> Result<JsonResponse, TransportFailure> {
        let attempts = config.retry_attempts.max(1);
        let mut last_status: Option<u16> = None;
        let mut last_excerpt = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff_delay(config.retry_backoff_seconds, attempt - 1);
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "transport_retry_sleep");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), url);
            req = self.apply_auth(req, config.token.as_deref());
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url, attempt, error = %e, "transport_request_error");
                    last_status = None;
                    last_excerpt = body_excerpt(&e.to_string());
                    continue;
                }
            };

            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();

            if (200..300).contains(&status) {
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) if text.trim().is_empty() => Value::Null,
                    Err(_) => {
                        return Err(TransportFailure {
                            status: Some(status),
                            excerpt: body_excerpt(&text),
                            attempts: attempt,
                            invalid_payload: true,
                        });
                    }
                };
                return Ok(JsonResponse { status, body: parsed });
            }

            last_status = Some(status);
            last_excerpt = body_excerpt(&text);

            if !is_transient(status) {
                // Non-transient 4xx/5xx: surface immediately
                return Err(TransportFailure {
                    status: Some(status),
                    excerpt: last_excerpt,
                    attempts: attempt,
                    invalid_payload: false,
                });
            }

            warn!(url, attempt, status, "transport_transient_status");
        }

        Err(TransportFailure {
            status: last_status,
            excerpt: last_excerpt,
            attempts,
            invalid_payload: false,
        })
    }
}

/* ============================= TESTS ============================= */
