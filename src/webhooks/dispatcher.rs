//! Event Dispatcher
//!
//! Resolves the subscriptions for an event and fans delivery out, one
//! spawned task per subscription. Every task runs to its own terminal
//! outcome; a failing, slow or panicking delivery never cancels or skips
//! another one. Log and counter side effects are best-effort.

use crate::metrics;
use crate::webhooks::payload::EventPayload;
use crate::webhooks::retry::{DeliveryOutcome, RetryScheduler, DEFAULT_MAX_RETRIES};
use crate::webhooks::store::{DeliveryLog, FailureCounter, SubscriptionStore, WebhookSubscription};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one subscription's delivery within a dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDelivery {
    pub subscription_id: String,
    /// `None` if the delivery task itself died
    pub outcome: Option<DeliveryOutcome>,
}

impl SubscriptionDelivery {
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().map(|o| o.success).unwrap_or(false)
    }
}

/// Everything that happened for one triggered event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub owner_id: String,
    pub event: String,
    pub deliveries: Vec<SubscriptionDelivery>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.deliveries.iter().filter(|d| d.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.succeeded()
    }

    pub fn get(&self, subscription_id: &str) -> Option<&SubscriptionDelivery> {
        self.deliveries
            .iter()
            .find(|d| d.subscription_id == subscription_id)
    }
}

/// Fans events out to matching subscriptions
#[derive(Clone)]
pub struct EventDispatcher {
    store: Arc<dyn SubscriptionStore>,
    log: Arc<dyn DeliveryLog>,
    counter: Arc<dyn FailureCounter>,
    scheduler: RetryScheduler,
    max_retries: u32,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        log: Arc<dyn DeliveryLog>,
        counter: Arc<dyn FailureCounter>,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            store,
            log,
            counter,
            scheduler,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry budget given to each subscription's delivery
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Deliver an event to every matching subscription of `owner_id`
    ///
    /// Returns once every delivery has reached a terminal state. Never fails:
    /// store errors end the dispatch as a no-op, and per-subscription failures
    /// are reported in the returned report.
    pub async fn trigger_event(
        &self,
        owner_id: &str,
        event_name: &str,
        data: serde_json::Value,
    ) -> DispatchReport {
        metrics::DISPATCHES_TOTAL.inc();
        let mut report = DispatchReport {
            owner_id: owner_id.to_string(),
            event: event_name.to_string(),
            deliveries: Vec::new(),
        };

        let subscriptions = match self.store.active_for(owner_id, event_name).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(owner_id, event = event_name, "Failed to load subscriptions: {:#}", e);
                metrics::record_collaborator_error("subscription_store");
                metrics::record_dispatch_aborted("subscription_store");
                return report;
            }
        };

        if subscriptions.is_empty() {
            debug!(owner_id, event = event_name, "No subscriptions match event");
            return report;
        }

        // Serialization failure leaves the report empty: no delivery was created
        let payload = match EventPayload::new(event_name, data).canonical_json() {
            Ok(payload) => Arc::new(payload),
            Err(e) => {
                error!(owner_id, event = event_name, "Cannot dispatch event: {}", e);
                metrics::record_dispatch_aborted("serialization");
                return report;
            }
        };

        info!(
            owner_id,
            event = event_name,
            subscription_count = subscriptions.len(),
            "Dispatching event"
        );

        let mut ids = Vec::with_capacity(subscriptions.len());
        let mut handles = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            ids.push(subscription.id.clone());
            handles.push(tokio::spawn(deliver_one(
                self.clone(),
                subscription,
                event_name.to_string(),
                Arc::clone(&payload),
            )));
        }

        for (subscription_id, joined) in ids.into_iter().zip(join_all(handles).await) {
            let outcome = match joined {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(subscription_id = %subscription_id, "Delivery task aborted: {}", e);
                    None
                }
            };
            report.deliveries.push(SubscriptionDelivery {
                subscription_id,
                outcome,
            });
        }

        info!(
            owner_id,
            event = event_name,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Dispatch settled"
        );
        report
    }
}

/// Run one subscription's delivery and report it to the collaborators
async fn deliver_one(
    dispatcher: EventDispatcher,
    subscription: WebhookSubscription,
    event: String,
    payload: Arc<String>,
) -> DeliveryOutcome {
    let outcome = dispatcher
        .scheduler
        .deliver(
            &subscription.url,
            subscription.secret.expose(),
            &event,
            &payload,
            dispatcher.max_retries,
        )
        .await;

    if let Err(e) = dispatcher.log.record(&subscription.id, &outcome).await {
        warn!(subscription_id = %subscription.id, "Failed to record delivery: {:#}", e);
        metrics::record_collaborator_error("delivery_log");
    }

    let counted = if outcome.success {
        dispatcher.counter.reset(&subscription.id).await
    } else {
        dispatcher.counter.increment(&subscription.id).await
    };
    if let Err(e) = counted {
        warn!(subscription_id = %subscription.id, "Failed to update failure counter: {:#}", e);
        metrics::record_collaborator_error("failure_counter");
    }

    outcome
}
