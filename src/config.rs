//! Configuration for the escrow service
//!
//! Settings come from an optional `escrow.toml` file overlaid with
//! `ESCROW_`-prefixed environment variables; everything has a sensible
//! default so tests and demos run with no external setup.

use std::time::Duration;

use serde::Deserialize;

use crate::{error::EscrowError, EscrowResult};

/// Top-level service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// JSON-RPC endpoint of the ledger node.
    pub ledger_url: String,
    /// Bounded timeout for every ledger call, in seconds.
    pub request_timeout_secs: u64,
    /// Flat transaction fee, in subunits.
    pub transaction_fee_subunits: u64,
    /// Minimum lead time `finish_after` must have over "now" at creation.
    pub min_finish_lead_secs: i64,
    /// Endpoint of the external attestation service.
    pub attestation_url: String,
    /// Bounded timeout for attestation calls, in seconds.
    pub attestation_timeout_secs: u64,
    /// How long finished requirement sets are retained for audit, in hours.
    pub requirement_retention_hours: i64,
    /// Stable-asset conversion policy.
    pub conversion: ConversionSettings,
}

/// Policy for sweeping released funds into the stable asset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    /// Currency code of the stable asset.
    pub stable_currency: String,
    /// Issuing address of the stable asset.
    pub stable_issuer: String,
    /// Trust line limit requested when creating the line, in units.
    pub trustline_limit: String,
    /// Native subunits kept on top of the ledger reserve when computing the
    /// spendable ceiling.
    pub fee_buffer_subunits: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ledger_url: "https://s.altnet.rippletest.net:51234".to_string(),
            request_timeout_secs: 20,
            transaction_fee_subunits: 12,
            min_finish_lead_secs: 60,
            attestation_url: "http://localhost:8090/verify".to_string(),
            attestation_timeout_secs: 30,
            requirement_retention_hours: 24 * 30,
            conversion: ConversionSettings::default(),
        }
    }
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            stable_currency: "USD".to_string(),
            stable_issuer: "rMwjYedjc7qqtKYVLiAccJSmCwih4LnE2q".to_string(),
            trustline_limit: "1000000000".to_string(),
            fee_buffer_subunits: 1_000_000,
        }
    }
}

impl Settings {
    /// Load settings from `escrow.toml` (if present) and the environment.
    pub fn load() -> EscrowResult<Self> {
        config::Config::builder()
            .add_source(config::File::with_name("escrow").required(false))
            .add_source(config::Environment::with_prefix("ESCROW").separator("__"))
            .build()
            .map_err(|e| EscrowError::config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| EscrowError::config(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn attestation_timeout(&self) -> Duration {
        Duration::from_secs(self.attestation_timeout_secs)
    }
}
