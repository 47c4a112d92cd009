// Prometheus metrics for webhook delivery
//
// - Deliveries by terminal state (counter)
// - Attempts by class (counter) and duration (histogram)
// - Backoff time spent waiting (counter)
// - Dispatches triggered and aborted before fan-out (counters)
// - Collaborator failures by collaborator (counter)

use crate::webhooks::delivery::AttemptClass;
use crate::webhooks::retry::DeliveryState;
use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("webhook_deliveries_total", "Webhook deliveries by terminal state"),
        &["state"]
    ).expect("Failed to create deliveries metric");

    pub static ref ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("webhook_attempts_total", "Webhook delivery attempts by class"),
        &["class"]
    ).expect("Failed to create attempts metric");

    pub static ref ATTEMPT_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("webhook_attempt_duration_seconds", "Duration of single delivery attempts"),
    ).expect("Failed to create attempt duration metric");

    pub static ref BACKOFF_SECONDS_TOTAL: Counter = Counter::new(
        "webhook_backoff_seconds_total",
        "Total time spent in retry backoff"
    ).expect("Failed to create backoff metric");

    pub static ref DISPATCHES_TOTAL: IntCounter = IntCounter::new(
        "webhook_dispatches_total",
        "Total number of events dispatched"
    ).expect("Failed to create dispatches metric");

    pub static ref DISPATCHES_ABORTED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("webhook_dispatches_aborted_total", "Dispatches that ended before any delivery started"),
        &["reason"]
    ).expect("Failed to create aborted dispatches metric");

    pub static ref COLLABORATOR_ERRORS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("webhook_collaborator_errors_total", "Failures of subscription store, delivery log and failure counter calls"),
        &["collaborator"]
    ).expect("Failed to create collaborator errors metric");
}

/// Register all metrics with the registry
///
/// Safe to call more than once; already registered collectors are skipped.
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(ATTEMPTS_TOTAL.clone()),
        Box::new(ATTEMPT_DURATION_SECONDS.clone()),
        Box::new(BACKOFF_SECONDS_TOTAL.clone()),
        Box::new(DISPATCHES_TOTAL.clone()),
        Box::new(DISPATCHES_ABORTED_TOTAL.clone()),
        Box::new(COLLABORATOR_ERRORS_TOTAL.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn record_attempt(class: AttemptClass, duration_ms: u64) {
    let label = match class {
        AttemptClass::Success => "success",
        AttemptClass::Permanent => "permanent",
        AttemptClass::Transient => "transient",
    };
    ATTEMPTS_TOTAL.with_label_values(&[label]).inc();
    ATTEMPT_DURATION_SECONDS.observe(duration_ms as f64 / 1000.0);
}

pub fn record_backoff(delay: Duration) {
    BACKOFF_SECONDS_TOTAL.inc_by(delay.as_secs_f64());
}

pub fn record_delivery(state: DeliveryState) {
    let label = match state {
        DeliveryState::Succeeded => "succeeded",
        DeliveryState::PermanentlyFailed => "permanently_failed",
        DeliveryState::ExhaustedFailed => "exhausted",
        _ => "unfinished",
    };
    DELIVERIES_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_dispatch_aborted(reason: &str) {
    DISPATCHES_ABORTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_collaborator_error(collaborator: &str) {
    COLLABORATOR_ERRORS_TOTAL
        .with_label_values(&[collaborator])
        .inc();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
