//! Hookcast Webhook Delivery Library
//!
//! Signs, sends, retries and fans out event notifications to externally
//! registered webhook endpoints.
//!
//! Subscriptions, delivery logs and failure counters are consumed through the
//! collaborator traits in [`webhooks::store`]; nothing here owns persistence.

pub mod config;
pub mod metrics;
pub mod webhooks;
