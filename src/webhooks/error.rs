//! Webhook Delivery Error Types
//!
//! Failures that end a delivery are carried as values inside a
//! `DeliveryOutcome`; nothing here is raised across the dispatcher boundary.

/// Error types for webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    /// The endpoint answered with a 4xx status. Never retried.
    #[error("endpoint rejected delivery after {attempts} attempt(s) with HTTP {status}: {body}")]
    ClientRejection {
        status: u16,
        attempts: u32,
        body: String,
    },

    /// Every attempt failed with a 5xx status or a network fault.
    #[error("delivery failed after {attempts} attempt(s); last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The event payload could not be turned into its canonical JSON form
    #[error("failed to serialize event payload: {0}")]
    Serialization(String),

    /// The HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl WebhookError {
    /// Whether this failure came from an endpoint's 4xx answer
    pub fn is_permanent(&self) -> bool {
        matches!(self, WebhookError::ClientRejection { .. })
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::Serialization(err.to_string())
    }
}
