// Webhook delivery subsystem
//
// Control flow: dispatcher -> retry scheduler (per subscription)
// -> delivery transport (per attempt), with the signer used once per delivery.

pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod retry;
pub mod signer;
pub mod store;

pub use delivery::{
    AttemptClass, DeliveryAttemptResult, DeliveryTransport, HttpDeliveryExecutor, ResponseBody,
    WebhookHeaders,
};
pub use dispatcher::{DispatchReport, EventDispatcher, SubscriptionDelivery};
pub use error::WebhookError;
pub use payload::EventPayload;
pub use retry::{
    backoff_delay, AttemptRecord, DeliveryOutcome, DeliveryState, RetryScheduler, RetrySettings,
    Sleeper, TokioSleeper,
};
pub use store::{
    DeliveryLog, FailureCounter, InMemoryDeliveryLog, InMemoryFailureCounter,
    InMemorySubscriptionStore, SubscriptionStore, WebhookSecret, WebhookSubscription,
};

// Property-based tests module
#[cfg(test)]
mod proptests;
