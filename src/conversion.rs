//! Conversion Adapter - best-effort sweep of released funds into a stable asset
//!
//! Runs after a successful finish as a linear sequence of awaited steps:
//! ensure a trust line for the stable asset exists, compute a spendable
//! ceiling that preserves the account's ledger reserve, then attempt a
//! partial-fill self-payment through available on-ledger liquidity.
//!
//! Release and conversion are deliberately decoupled: a conversion failure
//! or partial fill is reported in the outcome but never unwinds the finish.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::amount::subunits_to_units;
use crate::config::ConversionSettings;
use crate::error::EscrowError;
use crate::ledger::LedgerGateway;
use crate::signer::SignerProvider;
use crate::EscrowResult;

/// Partial-payment transaction flag: deliver as much as liquidity allows.
const TF_PARTIAL_PAYMENT: u64 = 0x0002_0000;

// Fallbacks when the server does not report reserve requirements.
const DEFAULT_RESERVE_BASE: u64 = 10_000_000;
const DEFAULT_RESERVE_INCREMENT: u64 = 2_000_000;

/// What the sweep achieved. Every field is advisory; nothing here affects
/// the already-settled escrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutcome {
    /// Whether any transaction was submitted.
    pub attempted: bool,
    /// Whether a new trust line was created on this run.
    pub trustline_created: bool,
    /// Stable-asset units delivered, when the payment applied.
    pub delivered_units: Option<String>,
    /// Why the sweep stopped early, when it did.
    pub skipped_reason: Option<String>,
    /// Raw result code of the last submitted transaction.
    pub result_code: Option<String>,
}

impl ConversionOutcome {
    fn skipped(reason: impl Into<String>, trustline_created: bool) -> Self {
        Self {
            attempted: trustline_created,
            trustline_created,
            delivered_units: None,
            skipped_reason: Some(reason.into()),
            result_code: None,
        }
    }
}

/// Spendable native subunits above the ledger reserve and a local fee buffer.
pub fn spendable_ceiling(
    balance: u64,
    owner_count: u64,
    reserve_base: u64,
    reserve_increment: u64,
    fee_buffer: u64,
) -> u64 {
    let reserved = reserve_base
        .saturating_add(owner_count.saturating_mul(reserve_increment))
        .saturating_add(fee_buffer);
    balance.saturating_sub(reserved)
}

/// Sweeps a beneficiary's released funds into the configured stable asset.
pub struct ConversionAdapter {
    gateway: Arc<LedgerGateway>,
    signers: Arc<dyn SignerProvider>,
    settings: ConversionSettings,
}

impl ConversionAdapter {
    pub fn new(
        gateway: Arc<LedgerGateway>,
        signers: Arc<dyn SignerProvider>,
        settings: ConversionSettings,
    ) -> Self {
        Self {
            gateway,
            signers,
            settings,
        }
    }

    /// Convert up to the spendable ceiling of `account`'s native balance
    /// into the stable asset.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures (transport, signer resolution) are
    /// errors; ledger rejections and empty ceilings are reported inside the
    /// outcome.
    pub async fn sweep_to_stable(&self, account: &str) -> EscrowResult<ConversionOutcome> {
        let signer = self.signers.resolve_signer(account).await?;

        let mut trustline_created = false;
        if !self.has_stable_trustline(account).await? {
            let tx = json!({
                "TransactionType": "TrustSet",
                "Account": account,
                "LimitAmount": {
                    "currency": self.settings.stable_currency,
                    "issuer": self.settings.stable_issuer,
                    "value": self.settings.trustline_limit,
                },
            });
            let outcome = self.gateway.submit_and_wait(tx, signer.as_ref()).await?;
            if !outcome.is_success() {
                warn!(account, code = %outcome.code, "trust line creation rejected");
                return Ok(ConversionOutcome {
                    attempted: true,
                    result_code: Some(outcome.code),
                    ..ConversionOutcome::skipped("trust line creation rejected", false)
                });
            }
            trustline_created = true;
            info!(account, currency = %self.settings.stable_currency, "trust line created");
        }

        let ceiling = self.ceiling_for(account).await?;
        if ceiling == 0 {
            return Ok(ConversionOutcome::skipped(
                "no spendable balance above the reserve",
                trustline_created,
            ));
        }

        // Partial payment to self: target the full ceiling, deliver whatever
        // liquidity allows.
        let tx = json!({
            "TransactionType": "Payment",
            "Account": account,
            "Destination": account,
            "Amount": {
                "currency": self.settings.stable_currency,
                "issuer": self.settings.stable_issuer,
                "value": subunits_to_units(ceiling),
            },
            "SendMax": ceiling.to_string(),
            "Flags": TF_PARTIAL_PAYMENT,
        });
        let outcome = self.gateway.submit_and_wait(tx, signer.as_ref()).await?;

        let delivered_units = if outcome.is_success() {
            outcome
                .raw
                .get("meta")
                .and_then(|m| m.get("delivered_amount"))
                .and_then(|d| d.get("value"))
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            warn!(account, code = %outcome.code, "conversion payment rejected");
            None
        };
        let skipped_reason = (!outcome.is_success()).then(|| "conversion payment rejected".into());

        info!(
            account,
            ceiling_subunits = ceiling,
            delivered = delivered_units.as_deref().unwrap_or("0"),
            "stable-asset sweep complete"
        );
        Ok(ConversionOutcome {
            attempted: true,
            trustline_created,
            delivered_units,
            skipped_reason,
            result_code: Some(outcome.code),
        })
    }

    async fn has_stable_trustline(&self, account: &str) -> EscrowResult<bool> {
        let lines = self.gateway.account_lines(account).await?;
        Ok(lines
            .get("lines")
            .and_then(Value::as_array)
            .map(|lines| {
                lines.iter().any(|line| {
                    line.get("currency").and_then(Value::as_str)
                        == Some(self.settings.stable_currency.as_str())
                        && line.get("account").and_then(Value::as_str)
                            == Some(self.settings.stable_issuer.as_str())
                })
            })
            .unwrap_or(false))
    }

    async fn ceiling_for(&self, account: &str) -> EscrowResult<u64> {
        let info = self.gateway.account_info(account).await?;
        let data = info
            .get("account_data")
            .ok_or_else(|| EscrowError::transport("account_info missing account_data"))?;
        let balance = data
            .get("Balance")
            .and_then(Value::as_str)
            .and_then(|b| b.parse::<u64>().ok())
            .ok_or_else(|| EscrowError::transport("account_info missing Balance"))?;
        let owner_count = data.get("OwnerCount").and_then(Value::as_u64).unwrap_or(0);

        let state = self.gateway.server_state().await?;
        let validated = state
            .get("state")
            .and_then(|s| s.get("validated_ledger"))
            .cloned()
            .unwrap_or(Value::Null);
        let reserve_base = validated
            .get("reserve_base")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_RESERVE_BASE);
        let reserve_increment = validated
            .get("reserve_inc")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_RESERVE_INCREMENT);

        Ok(spendable_ceiling(
            balance,
            owner_count,
            reserve_base,
            reserve_increment,
            self.settings.fee_buffer_subunits,
        ))
    }
}
