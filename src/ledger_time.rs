//! Time Authority - conversion between Unix time and the ledger epoch
//!
//! The ledger counts seconds from 2000-01-01T00:00:00Z, a fixed offset from
//! the Unix epoch. Conversion is pure integer arithmetic; no calendar logic.
//! Minimum-lead-time policy is enforced by the orchestrator, not here.

use chrono::Utc;

use crate::{error::EscrowError, EscrowResult};

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01T00:00:00Z).
pub const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

/// Convert a Unix timestamp (seconds) to ledger-epoch seconds.
///
/// # Errors
///
/// Returns a validation error for non-positive timestamps and for instants
/// that predate the ledger epoch; neither is representable on the ledger.
pub fn to_ledger_epoch(unix_seconds: i64) -> EscrowResult<u64> {
    if unix_seconds <= 0 {
        return Err(EscrowError::validation(
            "timestamp",
            format!("invalid timestamp: {unix_seconds} is not a positive unix time"),
        ));
    }
    if unix_seconds < LEDGER_EPOCH_OFFSET {
        return Err(EscrowError::validation(
            "timestamp",
            format!("invalid timestamp: {unix_seconds} predates the ledger epoch"),
        ));
    }
    Ok((unix_seconds - LEDGER_EPOCH_OFFSET) as u64)
}

/// Convert ledger-epoch seconds back to a Unix timestamp.
pub fn to_unix(ledger_seconds: u64) -> i64 {
    ledger_seconds as i64 + LEDGER_EPOCH_OFFSET
}

/// Current wall-clock time as Unix seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
