//! Conditional escrow backend for a distributed ledger
//!
//! This crate implements the escrow lifecycle and conditional release engine:
//! - Create / Finish / Cancel operations against ledger-held escrow records
//! - Cryptographic condition/fulfillment codec (PREIMAGE-SHA-256)
//! - A verification gate that releases funds once an external attestation
//!   service has verified every requirement
//! - Best-effort conversion of released funds into a stable asset

pub mod amount;
pub mod condition;
pub mod config;
pub mod conversion;
pub mod error;
pub mod escrow;
pub mod ledger;
pub mod ledger_time;
pub mod models;
pub mod node;
pub mod signer;
pub mod verification;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;

/// Initialize tracing output, honoring `RUST_LOG` when set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledger_escrow=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
