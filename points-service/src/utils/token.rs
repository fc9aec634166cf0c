//! Opaque credential generation and digesting.
//!
//! Codes, tokens, client secrets and OTPs are handed to callers once and only
//! their SHA-256 digests are persisted.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Random bytes behind every opaque token (256 bits).
const TOKEN_BYTES: usize = 32;

/// Digits in a one-time redemption code.
pub const OTP_DIGITS: u32 = 6;

/// Generate a URL-safe opaque credential from the OS CSPRNG.
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a public partner client identifier.
pub fn generate_client_id() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    format!("pc_{}", hex::encode(bytes))
}

/// Generate a zero-padded numeric one-time code.
pub fn generate_otp() -> String {
    let upper = 10u32.pow(OTP_DIGITS);
    let value = OsRng.gen_range(0..upper);
    format!("{:0width$}", value, width = OTP_DIGITS as usize)
}

/// SHA-256 hex digest used as the storage key for a credential.
pub fn digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a presented credential against a stored digest in constant time.
pub fn matches_digest(presented: &str, stored_digest: &str) -> bool {
    let candidate = digest(presented);
    candidate.as_bytes().ct_eq(stored_digest.as_bytes()).into()
}
