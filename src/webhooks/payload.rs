// Event payloads and their canonical wire form

use crate::webhooks::error::WebhookError;
use serde::{Deserialize, Serialize};

/// An event as sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event name, e.g. `generation.completed`
    pub event: String,
    /// Arbitrary event body
    pub data: serde_json::Value,
}

impl EventPayload {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize to the single string that is both signed and transmitted
    ///
    /// Object keys come out sorted and separators are compact, so the same
    /// event always yields byte-identical output.
    pub fn canonical_json(&self) -> Result<String, WebhookError> {
        let value = sort_keys(serde_json::to_value(self)?);
        Ok(serde_json::to_string(&value)?)
    }
}

/// Rebuild every object with its keys in ascending order
///
/// Holds even when serde_json's `preserve_order` feature is switched on by
/// another crate in the build.
fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}
