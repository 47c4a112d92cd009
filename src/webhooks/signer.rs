// HMAC-SHA256 payload signing for outgoing webhooks
//
// The signature covers the canonical payload string only. Receivers recompute
// it over the raw request body, so sender and receiver must hash the exact
// same bytes.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Sign a payload with the shared secret
///
/// Returns the lowercase hex encoding of HMAC-SHA256(secret, payload).
pub fn sign(payload: &str, secret: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature produced by [`sign`]
///
/// Both signatures are reduced to SHA-256 digests before the constant-time
/// comparison, so a supplied signature of the wrong length or with non-hex
/// characters takes the same path as a near miss and simply yields `false`.
pub fn verify(payload: &str, signature: &str, secret: &str) -> bool {
    let expected = sign(payload, secret);
    let expected_digest = Sha256::digest(expected.as_bytes());
    let supplied_digest = Sha256::digest(signature.as_bytes());
    expected_digest
        .as_slice()
        .ct_eq(supplied_digest.as_slice())
        .into()
}
