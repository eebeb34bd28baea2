//! Condition Codec - cryptographic commitment and proof-of-release envelopes
//!
//! Implements the PREIMAGE-SHA-256 crypto-condition encoding, the one
//! canonical commitment format used across create and verify:
//!
//! - condition (39 bytes): `A0 25 80 20 || SHA-256(preimage) || 81 01 20`
//! - fulfillment (36 bytes): `A0 22 80 20 || preimage`
//!
//! The condition alone is safe to publish; the preimage and fulfillment are
//! held exclusively by the releasing authority until release is authorized.
//! Verification checks structure before bytes and compares digests in
//! constant time.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::ConditionError;

/// Length in bytes of the secret preimage.
pub const SECRET_LEN: usize = 32;

/// Length in bytes of a serialized condition.
pub const CONDITION_LEN: usize = 39;

/// Length in bytes of a serialized fulfillment.
pub const FULFILLMENT_LEN: usize = 36;

// Envelope tags: type tag + length, fingerprint tag + length, cost tag.
const CONDITION_PREFIX: [u8; 4] = [0xA0, 0x25, 0x80, 0x20];
const CONDITION_SUFFIX: [u8; 3] = [0x81, 0x01, 0x20];
const FULFILLMENT_PREFIX: [u8; 4] = [0xA0, 0x22, 0x80, 0x20];

/// A freshly generated secret with its derived condition and fulfillment.
///
/// `condition` is publishable; `preimage` and `fulfillment` must stay with
/// the party authorized to release the escrow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionPair {
    /// Secret randomness, hex-encoded.
    pub preimage: String,
    /// One-way commitment over the secret, hex-encoded, safe to share.
    pub condition: String,
    /// Proof form submitted on release, hex-encoded.
    pub fulfillment: String,
}

impl ConditionPair {
    /// Generate a new random secret and derive its condition and fulfillment.
    pub fn generate() -> Self {
        let secret = generate_secret();
        Self::from_secret(&secret)
    }

    /// Derive a pair from an existing 32-byte secret.
    pub fn from_secret(secret: &[u8; SECRET_LEN]) -> Self {
        Self {
            preimage: hex::encode_upper(secret),
            condition: hex::encode_upper(commit(secret)),
            fulfillment: hex::encode_upper(build_fulfillment(secret)),
        }
    }
}

/// Generate 32 bytes of secret randomness from the OS CSPRNG.
pub fn generate_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Derive the publishable condition envelope from a secret.
pub fn commit(secret: &[u8; SECRET_LEN]) -> [u8; CONDITION_LEN] {
    let digest: [u8; 32] = Sha256::digest(secret).into();
    let mut out = [0u8; CONDITION_LEN];
    out[..4].copy_from_slice(&CONDITION_PREFIX);
    out[4..36].copy_from_slice(&digest);
    out[36..].copy_from_slice(&CONDITION_SUFFIX);
    out
}

/// Build the fulfillment envelope the ledger re-derives the condition from.
pub fn build_fulfillment(secret: &[u8; SECRET_LEN]) -> [u8; FULFILLMENT_LEN] {
    let mut out = [0u8; FULFILLMENT_LEN];
    out[..4].copy_from_slice(&FULFILLMENT_PREFIX);
    out[4..].copy_from_slice(secret);
    out
}

/// Parse a hex-encoded condition, returning the embedded digest.
///
/// # Errors
///
/// Returns [`ConditionError::MalformedCondition`] on bad hex, wrong length,
/// or wrong tag bytes.
pub fn parse_condition(condition_hex: &str) -> Result<[u8; 32], ConditionError> {
    let bytes = hex::decode(condition_hex)
        .map_err(|e| ConditionError::MalformedCondition(format!("invalid hex: {e}")))?;
    if bytes.len() != CONDITION_LEN {
        return Err(ConditionError::MalformedCondition(format!(
            "expected {CONDITION_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[..4] != CONDITION_PREFIX || bytes[36..] != CONDITION_SUFFIX {
        return Err(ConditionError::MalformedCondition(
            "unexpected envelope tag bytes".to_string(),
        ));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes[4..36]);
    Ok(digest)
}

/// Parse a hex-encoded fulfillment, returning the embedded preimage.
///
/// # Errors
///
/// Returns [`ConditionError::MalformedFulfillment`] on bad hex, wrong length,
/// or wrong tag bytes.
pub fn preimage_from_fulfillment(
    fulfillment_hex: &str,
) -> Result<[u8; SECRET_LEN], ConditionError> {
    let bytes = hex::decode(fulfillment_hex)
        .map_err(|e| ConditionError::MalformedFulfillment(format!("invalid hex: {e}")))?;
    if bytes.len() != FULFILLMENT_LEN {
        return Err(ConditionError::MalformedFulfillment(format!(
            "expected {FULFILLMENT_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[..4] != FULFILLMENT_PREFIX {
        return Err(ConditionError::MalformedFulfillment(
            "unexpected envelope tag bytes".to_string(),
        ));
    }
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&bytes[4..]);
    Ok(secret)
}

/// Verify that a secret satisfies a published condition.
///
/// The condition's structure is checked first; the digest comparison is
/// constant-time.
///
/// # Errors
///
/// [`ConditionError::InvalidSecretLength`] for a secret that is not 32 bytes,
/// [`ConditionError::MalformedCondition`] for a structurally invalid
/// condition, [`ConditionError::FulfillmentMismatch`] when the digests differ.
pub fn verify(secret: &[u8], condition_hex: &str) -> Result<(), ConditionError> {
    if secret.len() != SECRET_LEN {
        return Err(ConditionError::InvalidSecretLength(secret.len()));
    }
    let expected = parse_condition(condition_hex)?;
    let computed: [u8; 32] = Sha256::digest(secret).into();
    if computed.ct_eq(&expected).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(ConditionError::FulfillmentMismatch)
    }
}

/// Verify that a fulfillment envelope satisfies a published condition.
///
/// This is the local fail-fast check run before any ledger submission, so a
/// doomed release attempt never spends a transaction fee.
pub fn fulfillment_matches(
    fulfillment_hex: &str,
    condition_hex: &str,
) -> Result<(), ConditionError> {
    let secret = preimage_from_fulfillment(fulfillment_hex)?;
    verify(&secret, condition_hex)
}
