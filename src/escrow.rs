//! Escrow Orchestrator - builds, validates, and settles escrow operations
//!
//! The orchestrator never caches ledger state: every finish and cancel
//! re-fetches the escrow entry and validates against that single snapshot.
//! There is no per-escrow lock; the ledger's own atomic transitions are the
//! serialization point, and losing a settle race surfaces as the benign
//! `NotFound`.
//!
//! Timing semantics around `finish_after` differ by escrow kind:
//! - conditional escrow: `finish_after` is the *deadline* for conditional
//!   release - finishing is allowed strictly before it;
//! - plain time-locked escrow: `finish_after` is the *floor* - finishing is
//!   allowed at or after it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
#[cfg(test)]
use serde_json::Value;
use tracing::info;

use crate::condition;
use crate::error::{ConditionError, EscrowError, TimingError};
use crate::ledger::{LedgerGateway, SubmissionOutcome};
use crate::ledger_time::{self, now_unix};
use crate::models::{is_valid_address, EscrowRecord, EscrowState};
use crate::signer::SignerProvider;
use crate::EscrowResult;

/// Parameters for creating an escrow. Times are Unix seconds; the amount is
/// integer subunits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrowRequest {
    pub owner: String,
    pub destination: String,
    pub amount_subunits: u64,
    pub finish_after_unix: i64,
    pub cancel_after_unix: Option<i64>,
    pub condition_hex: Option<String>,
}

/// Result of a successful creation: the ledger-assigned handle plus the
/// normalized submission outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrowOutcome {
    pub sequence: u32,
    pub outcome: SubmissionOutcome,
}

/// Result of a successful finish. The released amount is read from the
/// fetched record, letting the caller chain a conversion step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishEscrowOutcome {
    pub amount_subunits: u64,
    pub outcome: SubmissionOutcome,
}

/// Result of a successful cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelEscrowOutcome {
    pub outcome: SubmissionOutcome,
}

/// A point-in-time view of an escrow, with Unix times at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowStatus {
    pub owner: String,
    pub destination: String,
    pub sequence: u32,
    pub amount_subunits: u64,
    pub finish_after_unix: Option<i64>,
    pub cancel_after_unix: Option<i64>,
    pub condition_hex: Option<String>,
    pub state: EscrowState,
}

/// The escrow state machine driver.
pub struct EscrowOrchestrator {
    gateway: Arc<LedgerGateway>,
    signers: Arc<dyn SignerProvider>,
    min_finish_lead_secs: i64,
}

impl EscrowOrchestrator {
    pub fn new(
        gateway: Arc<LedgerGateway>,
        signers: Arc<dyn SignerProvider>,
        min_finish_lead_secs: i64,
    ) -> Self {
        Self {
            gateway,
            signers,
            min_finish_lead_secs,
        }
    }

    /// Create an escrow locking `amount_subunits` from owner to destination.
    ///
    /// All validation runs before any ledger call; a request failing
    /// validation never reaches the network. A non-success ledger code is
    /// surfaced verbatim inside [`EscrowError::LedgerRejected`].
    pub async fn create(&self, request: CreateEscrowRequest) -> EscrowResult<CreateEscrowOutcome> {
        validate_create(&request, now_unix(), self.min_finish_lead_secs)?;

        let mut tx = json!({
            "TransactionType": "EscrowCreate",
            "Account": request.owner,
            "Destination": request.destination,
            "Amount": request.amount_subunits.to_string(),
            "FinishAfter": ledger_time::to_ledger_epoch(request.finish_after_unix)?,
        });
        if let Some(cancel_after) = request.cancel_after_unix {
            tx["CancelAfter"] = json!(ledger_time::to_ledger_epoch(cancel_after)?);
        }
        if let Some(condition_hex) = &request.condition_hex {
            tx["Condition"] = json!(condition_hex.to_uppercase());
        }

        let signer = self.signers.resolve_signer(&request.owner).await?;
        let outcome = self.gateway.submit_and_wait(tx, signer.as_ref()).await?;
        if !outcome.is_success() {
            return Err(EscrowError::ledger_rejected(
                &outcome.code,
                outcome.category.to_string(),
            ));
        }
        let sequence = outcome.consumed_sequence().ok_or_else(|| {
            EscrowError::unknown("ledger did not report the sequence the creation consumed")
        })?;

        info!(
            owner = %request.owner,
            destination = %request.destination,
            sequence,
            amount_subunits = request.amount_subunits,
            conditional = request.condition_hex.is_some(),
            "escrow created"
        );
        Ok(CreateEscrowOutcome { sequence, outcome })
    }

    /// Release the escrowed funds to the destination.
    ///
    /// `caller` must be the destination. For a conditional escrow the
    /// fulfillment is validated locally against the published condition
    /// before anything is submitted.
    pub async fn finish(
        &self,
        owner: &str,
        sequence: u32,
        caller: &str,
        fulfillment_hex: Option<&str>,
    ) -> EscrowResult<FinishEscrowOutcome> {
        let record = self.fetch(owner, sequence).await?;

        if caller != record.destination {
            return Err(EscrowError::authorization(format!(
                "destination address {}",
                record.destination
            )));
        }

        let now = now_unix();
        let mut tx = json!({
            "TransactionType": "EscrowFinish",
            "Account": caller,
            "Owner": owner,
            "OfferSequence": sequence,
        });

        if let Some(condition_hex) = &record.condition_hex {
            let fulfillment = fulfillment_hex.ok_or(ConditionError::MissingFulfillment)?;
            condition::fulfillment_matches(fulfillment, condition_hex)?;
            if let Some(deadline) = record.finish_after_unix() {
                if now >= deadline {
                    return Err(TimingError::DeadlinePassed { deadline }.into());
                }
            }
            tx["Condition"] = json!(condition_hex.to_uppercase());
            tx["Fulfillment"] = json!(fulfillment.to_uppercase());
        } else if let Some(floor) = record.finish_after_unix() {
            if now < floor {
                return Err(TimingError::TooEarly { not_before: floor }.into());
            }
        }

        let signer = self.signers.resolve_signer(caller).await?;
        let outcome = self.gateway.submit_and_wait(tx, signer.as_ref()).await?;
        if !outcome.is_success() {
            return Err(EscrowError::ledger_rejected(
                &outcome.code,
                outcome.category.to_string(),
            ));
        }

        info!(
            owner,
            sequence,
            amount_subunits = record.amount_subunits,
            "escrow finished"
        );
        Ok(FinishEscrowOutcome {
            amount_subunits: record.amount_subunits,
            outcome,
        })
    }

    /// Return the escrowed funds to the owner after the cancel window opens.
    pub async fn cancel(
        &self,
        owner: &str,
        sequence: u32,
        caller: &str,
    ) -> EscrowResult<CancelEscrowOutcome> {
        let record = self.fetch(owner, sequence).await?;

        if caller != record.owner {
            return Err(EscrowError::authorization(format!(
                "owner address {}",
                record.owner
            )));
        }
        // An escrow created without cancel_after stays uncancelable forever.
        let cancel_after = record.cancel_after_unix().ok_or(EscrowError::NoCancelPolicy)?;
        if now_unix() < cancel_after {
            return Err(TimingError::TooEarly {
                not_before: cancel_after,
            }
            .into());
        }

        let tx = json!({
            "TransactionType": "EscrowCancel",
            "Account": caller,
            "Owner": owner,
            "OfferSequence": sequence,
        });
        let signer = self.signers.resolve_signer(caller).await?;
        let outcome = self.gateway.submit_and_wait(tx, signer.as_ref()).await?;
        if !outcome.is_success() {
            return Err(EscrowError::ledger_rejected(
                &outcome.code,
                outcome.category.to_string(),
            ));
        }

        info!(owner, sequence, "escrow cancelled");
        Ok(CancelEscrowOutcome { outcome })
    }

    /// Report the current ledger-held state of an escrow.
    pub async fn status(&self, owner: &str, sequence: u32) -> EscrowResult<EscrowStatus> {
        let record = self.fetch(owner, sequence).await?;
        Ok(EscrowStatus {
            finish_after_unix: record.finish_after_unix(),
            cancel_after_unix: record.cancel_after_unix(),
            owner: record.owner,
            destination: record.destination,
            sequence: record.sequence,
            amount_subunits: record.amount_subunits,
            condition_hex: record.condition_hex,
            state: EscrowState::Active,
        })
    }

    async fn fetch(&self, owner: &str, sequence: u32) -> EscrowResult<EscrowRecord> {
        let entry = self
            .gateway
            .escrow_entry(owner, sequence)
            .await?
            .ok_or_else(|| EscrowError::NotFound {
                owner: owner.to_string(),
                sequence,
            })?;
        EscrowRecord::from_entry(&entry, sequence)
    }
}

/// Creation validation, in order; each rule is a distinct failure mode and
/// no rule touches the network.
fn validate_create(
    request: &CreateEscrowRequest,
    now: i64,
    min_finish_lead_secs: i64,
) -> EscrowResult<()> {
    if !is_valid_address(&request.destination) {
        return Err(EscrowError::validation(
            "destination",
            format!("{} is not a valid ledger address", request.destination),
        ));
    }
    if request.destination == request.owner {
        return Err(EscrowError::validation(
            "destination",
            "cannot escrow funds to the owning address",
        ));
    }
    if request.amount_subunits == 0 {
        return Err(EscrowError::validation(
            "amount",
            "amount must be at least one subunit",
        ));
    }
    let earliest_finish = now + min_finish_lead_secs;
    if request.finish_after_unix < earliest_finish {
        return Err(EscrowError::validation(
            "finish_after",
            format!(
                "finish_after must be at least {min_finish_lead_secs}s in the future (not before unix {earliest_finish})"
            ),
        ));
    }
    if let Some(cancel_after) = request.cancel_after_unix {
        if cancel_after <= now {
            return Err(EscrowError::validation(
                "cancel_after",
                "cancel_after must be in the future",
            ));
        }
        if cancel_after <= request.finish_after_unix {
            return Err(EscrowError::validation(
                "cancel_after",
                format!(
                    "cancel_after ({cancel_after}) must be strictly after finish_after ({})",
                    request.finish_after_unix
                ),
            ));
        }
    }
    if let Some(condition_hex) = &request.condition_hex {
        condition::parse_condition(condition_hex)?;
    }
    Ok(())
}
