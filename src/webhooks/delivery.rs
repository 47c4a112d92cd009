// Webhook delivery executor
//
// Performs exactly one bounded-time HTTP POST and normalizes what came back.
// Retry policy lives in the scheduler; nothing here loops.

use crate::webhooks::error::WebhookError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default per-attempt timeout
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Product identifier sent as `User-Agent`
pub const DEFAULT_USER_AGENT: &str = concat!("hookcast-webhooks/", env!("CARGO_PKG_VERSION"));

pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_EVENT: &str = "X-Webhook-Event";

/// Response body of an attempt
///
/// JSON bodies are parsed; anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
}

impl ResponseBody {
    /// Parse a raw body, falling back to the raw text
    pub fn parse(raw: String) -> Self {
        match serde_json::from_str(&raw) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(raw),
        }
    }

    /// A short single-line rendering for error messages
    pub fn excerpt(&self, max_chars: usize) -> String {
        let text = match self {
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Text(raw) => raw.trim().replace('\n', " "),
        };
        if text.chars().count() <= max_chars {
            text
        } else {
            let cut: String = text.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}

/// How the scheduler should treat an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptClass {
    /// 2xx
    Success,
    /// 4xx, never retried
    Permanent,
    /// 5xx, network fault or timeout
    Transient,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttemptResult {
    /// HTTP status, absent on network failure or timeout
    pub status_code: Option<u16>,
    /// Response body, if one was read
    pub body: Option<ResponseBody>,
    /// Error description for network-class failures
    pub error: Option<String>,
    /// Wall time spent on the attempt
    pub duration_ms: u64,
}

impl DeliveryAttemptResult {
    /// An attempt that produced an HTTP response
    pub fn from_status(status: u16, body: Option<ResponseBody>, duration_ms: u64) -> Self {
        Self {
            status_code: Some(status),
            body,
            error: None,
            duration_ms,
        }
    }

    /// An attempt that never produced an HTTP response
    pub fn network_failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status_code: None,
            body: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.classify() == AttemptClass::Success
    }

    /// Classify the attempt for retry purposes
    ///
    /// Informational and redirect statuses are treated as transient: the
    /// executor does not follow redirects and the endpoint never accepted
    /// the event.
    pub fn classify(&self) -> AttemptClass {
        match self.status_code {
            Some(status) if (200..300).contains(&status) => AttemptClass::Success,
            Some(status) if (400..500).contains(&status) => AttemptClass::Permanent,
            _ => AttemptClass::Transient,
        }
    }

    /// One-line description of what went wrong, if anything
    pub fn describe(&self) -> String {
        match (self.status_code, &self.error) {
            (Some(status), _) => match &self.body {
                Some(body) => format!("HTTP {}: {}", status, body.excerpt(200)),
                None => format!("HTTP {}", status),
            },
            (None, Some(error)) => error.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// The header set attached to every attempt of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub signature: String,
    pub timestamp_ms: i64,
    pub event: String,
    pub user_agent: String,
}

impl WebhookHeaders {
    /// Header name/value pairs in wire form
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(HEADER_SIGNATURE.to_string(), self.signature.clone());
        headers.insert(HEADER_TIMESTAMP.to_string(), self.timestamp_ms.to_string());
        headers.insert(HEADER_EVENT.to_string(), self.event.clone());
        headers.insert("User-Agent".to_string(), self.user_agent.clone());
        headers
    }
}

/// Transport for a single delivery attempt
///
/// Implementations must not retry and must bound the call by `timeout`.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn attempt(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> DeliveryAttemptResult;
}

/// HTTP delivery executor backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpDeliveryExecutor {
    client: reqwest::Client,
}

impl HttpDeliveryExecutor {
    /// Create a new executor
    ///
    /// Redirects are not followed: a subscriber URL that redirects is
    /// treated like any other non-2xx answer.
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryTransport for HttpDeliveryExecutor {
    async fn attempt(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> DeliveryAttemptResult {
        let start = Instant::now();

        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .body(body.to_owned());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let error = if e.is_timeout() {
                    format!("request timed out after {:?}", timeout)
                } else {
                    format!("request failed: {}", e)
                };
                warn!(url, elapsed_ms = elapsed, "Webhook attempt failed: {}", error);
                return DeliveryAttemptResult::network_failure(error, elapsed);
            }
        };

        let status = response.status().as_u16();

        // The request timeout also covers reading the body.
        let result = match response.text().await {
            Ok(raw) => {
                let body = if raw.is_empty() {
                    None
                } else {
                    Some(ResponseBody::parse(raw))
                };
                DeliveryAttemptResult::from_status(status, body, start.elapsed().as_millis() as u64)
            }
            Err(e) if e.is_timeout() => DeliveryAttemptResult::network_failure(
                format!("response body timed out after {:?}", timeout),
                start.elapsed().as_millis() as u64,
            ),
            Err(e) => {
                debug!(url, status, "Could not read webhook response body: {}", e);
                DeliveryAttemptResult::from_status(status, None, start.elapsed().as_millis() as u64)
            }
        };

        debug!(
            url,
            status,
            elapsed_ms = result.duration_ms,
            "Webhook attempt completed"
        );
        result
    }
}
