//! Error types for the escrow system
//!
//! The taxonomy separates failures that are resolved locally (validation,
//! authorization, timing, condition checks) from failures reported by the
//! ledger (`LedgerRejected`) and from ambiguous outcomes where a submission
//! may or may not have landed (`Unknown`). Nothing in this crate retries
//! automatically; retry policy belongs to the caller, because a blind retry
//! on `Unknown` risks double-submitting a funds-moving transaction.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Debug, Error)]
pub enum EscrowError {
    /// Bad input shape or range. Resolved locally; no ledger call was made.
    #[error("validation failed for {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The caller is not the party the operation requires.
    #[error("not authorized: operation requires {required_party}")]
    Authorization { required_party: String },

    /// The operation is outside its permitted time window.
    #[error(transparent)]
    Timing(#[from] TimingError),

    /// No escrow entry on the ledger for `(owner, sequence)`.
    ///
    /// Also the benign outcome of losing a finish/cancel race: the entry was
    /// consumed by a concurrent operation before this one re-fetched it.
    #[error("no escrow found for owner {owner} with sequence {sequence}")]
    NotFound { owner: String, sequence: u32 },

    /// No requirement set is tracked for this escrow sequence number.
    #[error("no requirement set for sequence {sequence}")]
    RequirementsNotFound { sequence: u32 },

    /// Condition/fulfillment codec failure.
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// The escrow was created without `cancel_after`; it can never be
    /// canceled by time. Intentional for workflows that only release via an
    /// explicit finish.
    #[error("escrow has no cancel policy: cancel_after was never set")]
    NoCancelPolicy,

    /// The transaction was submitted and the ledger returned a non-success
    /// code. The raw code is preserved for diagnostics.
    #[error("ledger rejected transaction with {code}: {message}")]
    LedgerRejected { code: String, message: String },

    /// Network or timeout ambiguity: the submission outcome is undetermined.
    /// The transaction may still land on the ledger; callers must reconcile
    /// via a status read before retrying.
    #[error("submission outcome unknown: {context}")]
    Unknown { context: String },

    /// Ledger connection or request transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// No signing capability could be resolved for the address.
    #[error("no signer available for address {address}")]
    NoSignerAvailable { address: String },

    /// Attestation service failure.
    #[error("attestation error: {0}")]
    Attestation(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(field: &'static str, reason: S) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Create an authorization error naming the required party
    pub fn authorization<S: Into<String>>(required_party: S) -> Self {
        Self::Authorization {
            required_party: required_party.into(),
        }
    }

    /// Create a ledger rejection error
    pub fn ledger_rejected<S: Into<String>, M: Into<String>>(code: S, message: M) -> Self {
        Self::LedgerRejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create an unknown-outcome error
    pub fn unknown<S: Into<String>>(context: S) -> Self {
        Self::Unknown {
            context: context.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an attestation error
    pub fn attestation<S: Into<String>>(msg: S) -> Self {
        Self::Attestation(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

/// Timing failures, with the boundary that was violated (Unix seconds) so a
/// caller can self-correct without a support round-trip.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimingError {
    /// The operation is not permitted yet.
    #[error("too early: not permitted before unix time {not_before}")]
    TooEarly { not_before: i64 },

    /// The window for conditional release has closed; the owner may cancel.
    #[error("deadline passed: conditional release closed at unix time {deadline}")]
    DeadlinePassed { deadline: i64 },
}

/// Condition/fulfillment codec failures. These are local validation errors
/// and are never coerced into a ledger submission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    /// The secret preimage must be exactly 32 bytes.
    #[error("secret must be exactly 32 bytes, got {0}")]
    InvalidSecretLength(usize),

    /// The condition blob is not a well-formed commitment envelope.
    #[error("malformed condition: {0}")]
    MalformedCondition(String),

    /// The fulfillment blob is not a well-formed proof envelope.
    #[error("malformed fulfillment: {0}")]
    MalformedFulfillment(String),

    /// The escrow carries a condition but no fulfillment was supplied.
    #[error("fulfillment is required for a conditional escrow")]
    MissingFulfillment,

    /// The fulfillment does not satisfy the published condition.
    #[error("fulfillment does not satisfy the published condition")]
    FulfillmentMismatch,
}
