//! Property-Based Tests for Webhook Signing and Backoff
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib webhooks::proptests
//! ```

use proptest::prelude::*;
use serde_json::Value;
use std::time::Duration;

use crate::webhooks::payload::EventPayload;
use crate::webhooks::retry::backoff_delay;
use crate::webhooks::signer::{sign, verify};

// Helper: Generate arbitrary flat JSON objects
fn arb_json_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z_]{1,8}", any::<i64>(), 0..6).prop_map(|m| {
        Value::Object(
            m.into_iter()
                .map(|(k, v)| (k, Value::Number(v.into())))
                .collect(),
        )
    })
}

// ============================================================================
// Property 1: Signatures verify and are deterministic
// ============================================================================

proptest! {
    #[test]
    fn prop_sign_then_verify(payload in ".*", secret in ".*") {
        let sig = sign(&payload, &secret);
        prop_assert!(verify(&payload, &sig, &secret));
    }

    #[test]
    fn prop_sign_is_deterministic(payload in ".*", secret in ".*") {
        prop_assert_eq!(sign(&payload, &secret), sign(&payload, &secret));
    }

    #[test]
    fn prop_wrong_length_signature_rejected(
        payload in ".*",
        secret in ".*",
        len in 0usize..200,
    ) {
        prop_assume!(len != 64);
        let bogus: String = "a".repeat(len);
        prop_assert!(!verify(&payload, &bogus, &secret));
    }

    #[test]
    fn prop_single_char_flip_rejected(payload in ".*", secret in ".*", idx in 0usize..64) {
        let sig = sign(&payload, &secret);
        let mut chars: Vec<char> = sig.chars().collect();
        chars[idx] = if chars[idx] == '0' { '1' } else { '0' };
        let flipped: String = chars.into_iter().collect();
        prop_assert!(!verify(&payload, &flipped, &secret));
    }
}

// ============================================================================
// Property 2: Canonical payloads are stable
// ============================================================================

proptest! {
    #[test]
    fn prop_canonical_json_reparse_is_fixed_point(event in "[a-z]+\\.[a-z]+", data in arb_json_object()) {
        let first = EventPayload::new(event, data).canonical_json().unwrap();
        let reparsed: EventPayload = serde_json::from_str(&first).unwrap();
        prop_assert_eq!(reparsed.canonical_json().unwrap(), first);
    }
}

// ============================================================================
// Property 3: Backoff doubles
// ============================================================================

proptest! {
    #[test]
    fn prop_backoff_doubles(retry in 0u32..20, unit_ms in 1u64..5000) {
        let unit = Duration::from_millis(unit_ms);
        prop_assert_eq!(backoff_delay(retry + 1, unit), backoff_delay(retry, unit) * 2);
    }
}
