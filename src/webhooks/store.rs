// Collaborator interfaces consumed by the dispatcher
//
// The delivery subsystem only reads subscriptions and reports outcomes.
// Persistence lives behind these traits; the in-memory versions back the
// CLI and the tests.

use crate::webhooks::retry::DeliveryOutcome;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tokio::sync::RwLock;

/// Event name that matches every event
pub const WILDCARD_EVENT: &str = "*";

/// Shared secret of a subscription
///
/// Redacted in `Debug`, `Display` and serialized output.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Raw secret, for signing only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(***)")
    }
}

impl fmt::Display for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for WebhookSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

impl<'de> Deserialize<'de> for WebhookSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(WebhookSecret)
    }
}

/// A registered webhook destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub owner_id: String,
    pub url: String,
    pub secret: WebhookSecret,
    /// Subscribed event names; `"*"` subscribes to everything
    pub events: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl WebhookSubscription {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
        events: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            url: url.into(),
            secret: WebhookSecret::new(secret),
            events: events.into_iter().map(Into::into).collect(),
            active: true,
            failure_count: 0,
            last_used_at: None,
        }
    }

    /// Check if this subscription should receive an event
    pub fn handles_event(&self, event_name: &str) -> bool {
        self.active
            && (self.events.contains(event_name) || self.events.contains(WILDCARD_EVENT))
    }
}

/// Read-only source of subscriptions
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscriptions of `owner_id` that listen for `event_name`
    async fn active_for(&self, owner_id: &str, event_name: &str) -> Result<Vec<WebhookSubscription>>;
}

/// Sink for finished deliveries
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn record(&self, subscription_id: &str, outcome: &DeliveryOutcome) -> Result<()>;
}

/// Consecutive-failure bookkeeping per subscription
#[async_trait]
pub trait FailureCounter: Send + Sync {
    async fn reset(&self, subscription_id: &str) -> Result<()>;
    async fn increment(&self, subscription_id: &str) -> Result<()>;
}

/// In-memory subscription store
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: RwLock<Vec<WebhookSubscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: Vec<WebhookSubscription>) -> Self {
        Self {
            subscriptions: RwLock::new(subscriptions),
        }
    }

    pub async fn insert(&self, subscription: WebhookSubscription) {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|s| s.id != subscription.id);
        subscriptions.push(subscription);
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn active_for(&self, owner_id: &str, event_name: &str) -> Result<Vec<WebhookSubscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .iter()
            .filter(|s| s.owner_id == owner_id && s.handles_event(event_name))
            .cloned()
            .collect())
    }
}

/// One logged delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subscription_id: String,
    pub outcome: DeliveryOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// In-memory delivery log
#[derive(Debug, Default)]
pub struct InMemoryDeliveryLog {
    records: RwLock<Vec<DeliveryRecord>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeliveryRecord> {
        self.records.read().await.clone()
    }

    /// Records for one subscription, oldest first
    pub async fn for_subscription(&self, subscription_id: &str) -> Vec<DeliveryRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeliveryLog for InMemoryDeliveryLog {
    async fn record(&self, subscription_id: &str, outcome: &DeliveryOutcome) -> Result<()> {
        let mut records = self.records.write().await;
        records.push(DeliveryRecord {
            subscription_id: subscription_id.to_string(),
            outcome: outcome.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

/// Counter state for one subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureState {
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// In-memory failure counter
#[derive(Debug, Default)]
pub struct InMemoryFailureCounter {
    counters: RwLock<HashMap<String, FailureState>>,
}

impl InMemoryFailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current consecutive failures for a subscription (0 if never seen)
    pub async fn count(&self, subscription_id: &str) -> u32 {
        self.counters
            .read()
            .await
            .get(subscription_id)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> HashMap<String, FailureState> {
        self.counters.read().await.clone()
    }
}

#[async_trait]
impl FailureCounter for InMemoryFailureCounter {
    async fn reset(&self, subscription_id: &str) -> Result<()> {
        let mut counters = self.counters.write().await;
        let state = counters.entry(subscription_id.to_string()).or_default();
        state.consecutive_failures = 0;
        state.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn increment(&self, subscription_id: &str) -> Result<()> {
        let mut counters = self.counters.write().await;
        let state = counters.entry(subscription_id.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_used_at = Some(Utc::now());
        Ok(())
    }
}
