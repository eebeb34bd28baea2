//! Shared data model for the escrow system
//!
//! The ledger-resident escrow entry is never cached: every operation
//! re-fetches it by `(owner, sequence)` and parses a fresh snapshot through
//! [`EscrowRecord::from_entry`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::EscrowError, ledger_time, EscrowResult};

/// Lifecycle of one escrow operation as seen by this system.
///
/// The ledger itself only ever holds `Active` entries; `Finished` and
/// `Cancelled` entries are removed from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    /// Operation accepted locally, not yet submitted.
    Requested,
    /// Transaction handed to the ledger, outcome pending.
    Submitted,
    /// On ledger, awaiting finish or cancel.
    Active,
    /// The ledger returned a definitive non-success code.
    Rejected,
    /// Funds released to the destination (terminal).
    Finished,
    /// Funds returned to the owner (terminal).
    Cancelled,
}

impl EscrowState {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Finished | Self::Cancelled)
    }
}

/// A snapshot of a ledger-held escrow entry.
///
/// Time fields are ledger-epoch seconds exactly as stored on the ledger;
/// use the accessors for Unix time at the public boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowRecord {
    /// Depositor address.
    pub owner: String,
    /// Beneficiary address.
    pub destination: String,
    /// Locked amount in integer subunits.
    pub amount_subunits: u64,
    /// Ledger-epoch instant gating finish. Absent means finishable
    /// immediately, subject to the condition.
    pub finish_after_ledger: Option<u64>,
    /// Ledger-epoch instant after which the owner may cancel. Absent means
    /// never cancelable by time.
    pub cancel_after_ledger: Option<u64>,
    /// Published commitment blob, hex-encoded.
    pub condition_hex: Option<String>,
    /// Ledger-assigned sequence number; with `owner` this is the escrow's
    /// identity.
    pub sequence: u32,
}

impl EscrowRecord {
    /// Parse a ledger entry object into a record.
    ///
    /// # Errors
    ///
    /// Returns a transport error when mandatory fields are missing or have
    /// an unexpected shape; the entry came from the ledger, so a shape
    /// mismatch is a protocol problem, not caller input.
    pub fn from_entry(entry: &Value, sequence: u32) -> EscrowResult<Self> {
        let owner = required_str(entry, "Account")?;
        let destination = required_str(entry, "Destination")?;
        let amount_subunits = required_str(entry, "Amount")?
            .parse::<u64>()
            .map_err(|e| EscrowError::transport(format!("unparsable escrow Amount: {e}")))?;

        Ok(Self {
            owner,
            destination,
            amount_subunits,
            finish_after_ledger: entry.get("FinishAfter").and_then(Value::as_u64),
            cancel_after_ledger: entry.get("CancelAfter").and_then(Value::as_u64),
            condition_hex: entry
                .get("Condition")
                .and_then(Value::as_str)
                .map(str::to_string),
            sequence,
        })
    }

    /// `FinishAfter` as Unix seconds.
    pub fn finish_after_unix(&self) -> Option<i64> {
        self.finish_after_ledger.map(ledger_time::to_unix)
    }

    /// `CancelAfter` as Unix seconds.
    pub fn cancel_after_unix(&self) -> Option<i64> {
        self.cancel_after_ledger.map(ledger_time::to_unix)
    }
}

fn required_str(entry: &Value, field: &str) -> EscrowResult<String> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EscrowError::transport(format!("escrow entry missing field {field}")))
}

/// Ledger address alphabet (base58 with the ledger's letter ordering).
const ADDRESS_PREFIX: char = 'r';
const MIN_ADDRESS_LEN: usize = 25;
const MAX_ADDRESS_LEN: usize = 35;

/// Check that a string is a syntactically valid ledger address.
///
/// Syntax only: prefix, length, and base58 alphabet. Existence of the
/// account is the ledger's concern.
pub fn is_valid_address(address: &str) -> bool {
    if !address.starts_with(ADDRESS_PREFIX) {
        return false;
    }
    if !(MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&address.len()) {
        return false;
    }
    bs58::decode(address)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_vec()
        .is_ok()
}
