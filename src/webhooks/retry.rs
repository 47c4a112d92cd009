// Retry scheduling for a single webhook delivery
//
// One delivery = one (subscription, event) pair:
// - the payload is signed once and the timestamp fixed up front
// - up to max_retries + 1 sequential attempts
// - 2xx ends the loop, 4xx ends it immediately, 5xx/network faults retry
// - backoff before retry n is unit * 2^n (1, 2, 4, ... units), no jitter, no cap

use crate::metrics;
use crate::webhooks::delivery::{
    AttemptClass, DeliveryAttemptResult, DeliveryTransport, WebhookHeaders,
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_USER_AGENT,
};
use crate::webhooks::error::WebhookError;
use crate::webhooks::signer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff unit
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Characters of response body kept in a rejection message
const BODY_EXCERPT_CHARS: usize = 200;

/// Backoff wait before retry `n` (0-indexed): `unit * 2^n`
///
/// Every value is an exact power-of-two multiple of `unit`; once that no
/// longer fits in a `Duration` the result saturates at `Duration::MAX`.
pub fn backoff_delay(retry: u32, unit: Duration) -> Duration {
    if unit.is_zero() {
        return Duration::ZERO;
    }
    1u128
        .checked_shl(retry)
        .and_then(|factor| unit.as_nanos().checked_mul(factor))
        .and_then(|nanos| {
            let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
            Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
        })
        .unwrap_or(Duration::MAX)
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Whole milliseconds, saturating at `u64::MAX`
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Something that can wait
///
/// Backoff goes through this so tests can observe the waits without
/// actually sleeping.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Delivery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Created, no attempt made yet
    Pending,
    /// An attempt is in flight
    Attempting,
    /// Waiting out a backoff before the next attempt
    Retrying,
    /// Endpoint answered 2xx
    Succeeded,
    /// Endpoint answered 4xx
    PermanentlyFailed,
    /// Retry budget consumed without success
    ExhaustedFailed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Succeeded | DeliveryState::PermanentlyFailed | DeliveryState::ExhaustedFailed
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, Attempting)
                | (Attempting, Succeeded)
                | (Attempting, PermanentlyFailed)
                | (Attempting, Retrying)
                | (Attempting, ExhaustedFailed)
                | (Retrying, Attempting)
        )
    }
}

/// Record of one attempt inside a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-indexed attempt number
    pub attempt: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub class: AttemptClass,
    pub duration_ms: u64,
    /// Backoff waited after this attempt, if a retry followed
    pub backoff_ms: Option<u64>,
}

/// Terminal result of a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Unique ID for this delivery
    pub delivery_id: String,
    pub event: String,
    pub success: bool,
    /// Total attempts made
    pub attempts: u32,
    pub state: DeliveryState,
    pub last_status: Option<u16>,
    /// Human-readable failure description; names the attempt count and
    /// last status or error
    pub last_error: Option<String>,
    /// Timestamp sent with every attempt (ms since epoch)
    pub timestamp_ms: i64,
    pub history: Vec<AttemptRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn new_delivery_id() -> String {
    format!("dlv-{}", uuid::Uuid::new_v4())
}

/// Retry scheduler settings
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Timeout applied to each attempt
    pub attempt_timeout: Duration,
    /// Base unit for exponential backoff
    pub backoff_unit: Duration,
    /// `User-Agent` sent with every attempt
    pub user_agent: String,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Drives repeated attempts for one subscription
#[derive(Clone)]
pub struct RetryScheduler {
    transport: Arc<dyn DeliveryTransport>,
    sleeper: Arc<dyn Sleeper>,
    settings: RetrySettings,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("transport", &"<transport>")
            .field("sleeper", &"<sleeper>")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RetryScheduler {
    /// Create a scheduler over the given transport, sleeping with tokio
    pub fn new(transport: Arc<dyn DeliveryTransport>) -> Self {
        Self {
            transport,
            sleeper: Arc::new(TokioSleeper),
            settings: RetrySettings::default(),
        }
    }

    /// Replace the sleeper used for backoff waits
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_settings(mut self, settings: RetrySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Deliver a canonical payload to one target
    ///
    /// `payload` must already be the canonical string; it is signed once and
    /// sent unchanged on every attempt. Never returns an error: every failure
    /// ends up in the outcome.
    pub async fn deliver(
        &self,
        target_url: &str,
        secret: &str,
        event: &str,
        payload: &str,
        max_retries: u32,
    ) -> DeliveryOutcome {
        let started_at = Utc::now();
        let delivery_id = new_delivery_id();
        let headers = WebhookHeaders {
            signature: signer::sign(payload, secret),
            timestamp_ms: started_at.timestamp_millis(),
            event: event.to_string(),
            user_agent: self.settings.user_agent.clone(),
        }
        .to_map();

        let mut state = DeliveryState::Pending;
        let mut history = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            advance(&mut state, DeliveryState::Attempting);
            debug!(%delivery_id, event, attempt, "Webhook delivery attempt");

            let result = self
                .transport
                .attempt(target_url, &headers, payload, self.settings.attempt_timeout)
                .await;
            let class = result.classify();
            metrics::record_attempt(class, result.duration_ms);

            let mut record = AttemptRecord {
                attempt,
                status_code: result.status_code,
                error: result.error.clone(),
                class,
                duration_ms: result.duration_ms,
                backoff_ms: None,
            };
            let made = attempt + 1;

            let failure = match class {
                AttemptClass::Success => {
                    advance(&mut state, DeliveryState::Succeeded);
                    info!(%delivery_id, event, attempts = made, "Webhook delivered");
                    None
                }
                AttemptClass::Permanent => {
                    advance(&mut state, DeliveryState::PermanentlyFailed);
                    let err = rejection(&result, made);
                    warn!(%delivery_id, event, attempts = made, "Webhook rejected: {}", err);
                    Some(err)
                }
                AttemptClass::Transient if attempt < max_retries => {
                    advance(&mut state, DeliveryState::Retrying);
                    let delay = backoff_delay(attempt, self.settings.backoff_unit);
                    record.backoff_ms = Some(saturating_millis(delay));
                    history.push(record);
                    debug!(
                        %delivery_id,
                        event,
                        attempt,
                        delay_ms = saturating_millis(delay),
                        "Transient failure ({}), retrying",
                        result.describe()
                    );
                    metrics::record_backoff(delay);
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                AttemptClass::Transient => {
                    advance(&mut state, DeliveryState::ExhaustedFailed);
                    let err = WebhookError::Exhausted {
                        attempts: made,
                        last_error: result.describe(),
                    };
                    warn!(%delivery_id, event, attempts = made, "Webhook delivery exhausted: {}", err);
                    Some(err)
                }
            };

            history.push(record);
            let outcome = DeliveryOutcome {
                delivery_id,
                event: event.to_string(),
                success: failure.is_none(),
                attempts: made,
                state,
                last_status: result.status_code,
                last_error: failure.map(|e| e.to_string()),
                timestamp_ms: started_at.timestamp_millis(),
                history,
                started_at,
                finished_at: Utc::now(),
            };
            metrics::record_delivery(outcome.state);
            return outcome;
        }
    }

    /// Deliver a structured payload, canonicalizing it first
    ///
    /// Fails only if the payload cannot be serialized, in which case nothing
    /// is sent and no delivery state is produced.
    pub async fn deliver_payload(
        &self,
        target_url: &str,
        secret: &str,
        payload: &crate::webhooks::payload::EventPayload,
        max_retries: u32,
    ) -> Result<DeliveryOutcome, WebhookError> {
        let body = payload.canonical_json()?;
        Ok(self
            .deliver(target_url, secret, &payload.event, &body, max_retries)
            .await)
    }
}

fn advance(state: &mut DeliveryState, next: DeliveryState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal delivery transition {:?} -> {:?}",
        state,
        next
    );
    *state = next;
}

fn rejection(result: &DeliveryAttemptResult, attempts: u32) -> WebhookError {
    WebhookError::ClientRejection {
        status: result.status_code.unwrap_or_default(),
        attempts,
        body: result
            .body
            .as_ref()
            .map(|b| b.excerpt(BODY_EXCERPT_CHARS))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::delivery::{ResponseBody, HEADER_SIGNATURE, HEADER_TIMESTAMP};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    /// Transport that replays scripted results and records what it was sent
    struct ScriptedTransport {
        script: Mutex<VecDeque<DeliveryAttemptResult>>,
        fallback: DeliveryAttemptResult,
        seen: Mutex<Vec<(BTreeMap<String, String>, String)>>,
    }

    impl ScriptedTransport {
        fn always(result: DeliveryAttemptResult) -> Self {
            Self::scripted(Vec::new(), result)
        }

        fn scripted(script: Vec<DeliveryAttemptResult>, fallback: DeliveryAttemptResult) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliveryTransport for ScriptedTransport {
        async fn attempt(
            &self,
            _url: &str,
            headers: &BTreeMap<String, String>,
            body: &str,
            _timeout: Duration,
        ) -> DeliveryAttemptResult {
            self.seen
                .lock()
                .unwrap()
                .push((headers.clone(), body.to_string()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Sleeper that records requested waits and returns immediately
    #[derive(Clone, Default)]
    struct RecordingSleeper {
        waits: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingSleeper {
        fn waits(&self) -> Vec<Duration> {
            self.waits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    fn status(code: u16) -> DeliveryAttemptResult {
        DeliveryAttemptResult::from_status(code, None, 1)
    }

    fn scheduler(transport: Arc<ScriptedTransport>, sleeper: RecordingSleeper) -> RetryScheduler {
        RetryScheduler::new(transport).with_sleeper(sleeper)
    }

    const URL: &str = "https://hooks.example.com/in";
    const BODY: &str = r#"{"data":{},"event":"job.completed"}"#;

    #[test]
    fn test_backoff_delay_doubles() {
        let unit = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, unit), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, unit), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, unit), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, unit), Duration::from_secs(32));
    }

    #[test]
    fn test_backoff_delay_saturates() {
        assert_eq!(backoff_delay(200, Duration::from_secs(1)), Duration::MAX);
        assert_eq!(backoff_delay(64, Duration::from_secs(1)), Duration::MAX);
        assert_eq!(backoff_delay(1, Duration::MAX), Duration::MAX);
        assert_eq!(backoff_delay(500, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_backoff_delay_keeps_doubling_past_u32() {
        let unit = Duration::from_millis(1);
        assert_eq!(backoff_delay(31, unit), Duration::from_millis(1 << 31));
        assert_eq!(backoff_delay(32, unit), Duration::from_millis(1 << 32));
        assert_eq!(backoff_delay(40, unit), Duration::from_millis(1 << 40));
        assert_eq!(backoff_delay(33, unit), backoff_delay(32, unit) * 2);
    }

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_huge_backoff_is_recorded_saturated() {
        let transport = Arc::new(ScriptedTransport::always(status(503)));
        let sleeper = RecordingSleeper::default();
        let settings = RetrySettings {
            backoff_unit: Duration::MAX,
            ..RetrySettings::default()
        };
        let outcome = scheduler(transport, sleeper.clone())
            .with_settings(settings)
            .deliver(URL, "secret", "job.completed", BODY, 1)
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.history[0].backoff_ms, Some(u64::MAX));
        assert_eq!(sleeper.waits(), vec![Duration::MAX]);
    }

    #[tokio::test]
    async fn test_deliver_payload_signs_canonical_body() {
        let transport = Arc::new(ScriptedTransport::always(status(200)));
        let payload = crate::webhooks::payload::EventPayload::new(
            "job.completed",
            serde_json::json!({"b": 2, "a": 1}),
        );
        let outcome = scheduler(transport.clone(), RecordingSleeper::default())
            .deliver_payload(URL, "secret", &payload, 3)
            .await
            .unwrap();

        assert!(outcome.success);
        let (headers, body) = transport.seen.lock().unwrap()[0].clone();
        assert_eq!(body, r#"{"data":{"a":1,"b":2},"event":"job.completed"}"#);
        assert_eq!(headers[HEADER_SIGNATURE], signer::sign(&body, "secret"));
    }

    #[test]
    fn test_state_transitions() {
        use DeliveryState::*;
        assert!(Pending.can_transition_to(Attempting));
        assert!(Attempting.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Attempting));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Attempting));
        assert!(!Retrying.can_transition_to(ExhaustedFailed));

        assert!(Succeeded.is_terminal());
        assert!(PermanentlyFailed.is_terminal());
        assert!(ExhaustedFailed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let transport = Arc::new(ScriptedTransport::always(status(200)));
        let sleeper = RecordingSleeper::default();
        let outcome = scheduler(transport.clone(), sleeper.clone())
            .deliver(URL, "secret", "job.completed", BODY, 3)
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.state, DeliveryState::Succeeded);
        assert_eq!(outcome.last_error, None);
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::always(DeliveryAttemptResult::from_status(
            404,
            Some(ResponseBody::Text("unknown hook".to_string())),
            1,
        )));
        let sleeper = RecordingSleeper::default();
        let outcome = scheduler(transport.clone(), sleeper.clone())
            .deliver(URL, "secret", "job.completed", BODY, 3)
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.state, DeliveryState::PermanentlyFailed);
        assert_eq!(outcome.last_status, Some(404));
        let err = outcome.last_error.unwrap();
        assert!(err.contains("404"));
        assert!(err.contains("unknown hook"));
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_exhausts_with_backoff() {
        let transport = Arc::new(ScriptedTransport::always(status(500)));
        let sleeper = RecordingSleeper::default();
        let outcome = scheduler(transport.clone(), sleeper.clone())
            .deliver(URL, "secret", "job.completed", BODY, 2)
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.state, DeliveryState::ExhaustedFailed);
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            sleeper.waits(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        let err = outcome.last_error.unwrap();
        assert!(err.contains("3 attempt"));
        assert!(err.contains("500"));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let transport = Arc::new(ScriptedTransport::scripted(
            vec![
                DeliveryAttemptResult::network_failure("request timed out after 10s", 10_000),
                status(503),
            ],
            status(200),
        ));
        let sleeper = RecordingSleeper::default();
        let outcome = scheduler(transport.clone(), sleeper.clone())
            .deliver(URL, "secret", "job.completed", BODY, 3)
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.history[0].status_code, None);
        assert_eq!(outcome.history[0].backoff_ms, Some(1000));
        assert_eq!(outcome.history[1].status_code, Some(503));
        assert_eq!(outcome.history[1].backoff_ms, Some(2000));
        assert_eq!(outcome.history[2].backoff_ms, None);
    }

    #[tokio::test]
    async fn test_permanent_failure_after_transient_stops_early() {
        let transport = Arc::new(ScriptedTransport::scripted(vec![status(502)], status(410)));
        let sleeper = RecordingSleeper::default();
        let outcome = scheduler(transport.clone(), sleeper.clone())
            .deliver(URL, "secret", "job.completed", BODY, 5)
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.state, DeliveryState::PermanentlyFailed);
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let transport = Arc::new(ScriptedTransport::always(status(503)));
        let sleeper = RecordingSleeper::default();
        let outcome = scheduler(transport.clone(), sleeper.clone())
            .deliver(URL, "secret", "job.completed", BODY, 0)
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.state, DeliveryState::ExhaustedFailed);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_signature_and_timestamp_fixed_across_attempts() {
        let transport = Arc::new(ScriptedTransport::always(status(500)));
        let outcome = scheduler(transport.clone(), RecordingSleeper::default())
            .deliver(URL, "secret", "job.completed", BODY, 2)
            .await;

        let seen = transport.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        let (first_headers, _) = &seen[0];
        for (headers, body) in &seen {
            assert_eq!(headers, first_headers);
            assert_eq!(body, BODY);
        }
        assert_eq!(first_headers[HEADER_SIGNATURE], signer::sign(BODY, "secret"));
        assert_eq!(
            first_headers[HEADER_TIMESTAMP],
            outcome.timestamp_ms.to_string()
        );
    }

    #[tokio::test]
    async fn test_custom_backoff_unit() {
        let transport = Arc::new(ScriptedTransport::always(status(500)));
        let sleeper = RecordingSleeper::default();
        let settings = RetrySettings {
            backoff_unit: Duration::from_millis(10),
            ..RetrySettings::default()
        };
        RetryScheduler::new(transport)
            .with_sleeper(sleeper.clone())
            .with_settings(settings)
            .deliver(URL, "secret", "job.completed", BODY, 3)
            .await;

        assert_eq!(
            sleeper.waits(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }
}
