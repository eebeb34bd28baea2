//! Top-level service node
//!
//! `EscrowNode` owns the wiring: settings, ledger gateway, signer provider,
//! escrow orchestrator, verification gate, and conversion adapter. It is the
//! one place where human-facing unit amounts are converted to the ledger's
//! integer subunits; everything below this boundary works in subunits only.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::amount;
use crate::config::Settings;
use crate::conversion::ConversionAdapter;
use crate::escrow::{
    CancelEscrowOutcome, CreateEscrowOutcome, CreateEscrowRequest, EscrowOrchestrator,
    EscrowStatus, FinishEscrowOutcome,
};
use crate::ledger::{HttpTransport, LedgerGateway, LedgerTransport, SubmissionOutcome};
use crate::signer::SignerProvider;
use crate::verification::{
    AttestationClient, EvidenceSubmission, HttpAttestationClient, MemoryRequirementStore,
    ProofReport, QaEscrowCreated, QaEscrowRequest, RequirementSet, RequirementStore,
    VerificationGate,
};
use crate::EscrowResult;

/// Parameters for creating a plain or conditional escrow, with the amount in
/// human units (e.g. "25.5").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrowParams {
    pub owner: String,
    pub destination: String,
    pub amount_units: String,
    pub finish_after_unix: i64,
    pub cancel_after_unix: Option<i64>,
    pub condition_hex: Option<String>,
}

/// Parameters for creating a verification-gated escrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQaEscrowParams {
    pub owner: String,
    pub destination: String,
    pub amount_units: String,
    pub finish_after_unix: i64,
    pub cancel_after_unix: Option<i64>,
    pub requirements: Vec<String>,
}

/// The assembled escrow service.
pub struct EscrowNode {
    settings: Settings,
    gateway: Arc<LedgerGateway>,
    orchestrator: Arc<EscrowOrchestrator>,
    gate: VerificationGate,
}

impl EscrowNode {
    /// Assemble a node from explicit parts. Tests and embedders inject fake
    /// transports, attestation clients, and stores here.
    pub fn with_parts(
        settings: Settings,
        transport: Arc<dyn LedgerTransport>,
        signers: Arc<dyn SignerProvider>,
        attestation: Arc<dyn AttestationClient>,
        store: Arc<dyn RequirementStore>,
    ) -> Self {
        let gateway = Arc::new(LedgerGateway::new(
            transport,
            settings.request_timeout(),
            settings.transaction_fee_subunits,
        ));
        let orchestrator = Arc::new(EscrowOrchestrator::new(
            Arc::clone(&gateway),
            Arc::clone(&signers),
            settings.min_finish_lead_secs,
        ));
        let conversion = Arc::new(ConversionAdapter::new(
            Arc::clone(&gateway),
            signers,
            settings.conversion.clone(),
        ));
        let gate = VerificationGate::new(
            Arc::clone(&orchestrator),
            attestation,
            store,
            conversion,
        );
        Self {
            settings,
            gateway,
            orchestrator,
            gate,
        }
    }

    /// Assemble a node against the configured HTTP ledger endpoint and
    /// attestation service, with in-memory requirement storage.
    pub fn connect(settings: Settings, signers: Arc<dyn SignerProvider>) -> EscrowResult<Self> {
        info!(url = %settings.ledger_url, "connecting escrow node");
        let transport = Arc::new(HttpTransport::new(settings.ledger_url.clone()));
        let attestation = Arc::new(HttpAttestationClient::new(
            settings.attestation_url.clone(),
            settings.attestation_timeout(),
        )?);
        let store = Arc::new(MemoryRequirementStore::new());
        Ok(Self::with_parts(
            settings,
            transport,
            signers,
            attestation,
            store,
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create an escrow, converting the unit amount at this boundary.
    pub async fn create_escrow(
        &self,
        params: CreateEscrowParams,
    ) -> EscrowResult<CreateEscrowOutcome> {
        let amount_subunits = amount::units_to_subunits(&params.amount_units)?;
        self.orchestrator
            .create(CreateEscrowRequest {
                owner: params.owner,
                destination: params.destination,
                amount_subunits,
                finish_after_unix: params.finish_after_unix,
                cancel_after_unix: params.cancel_after_unix,
                condition_hex: params.condition_hex,
            })
            .await
    }

    /// Finish an escrow as `caller`, supplying the fulfillment when the
    /// escrow is conditional.
    pub async fn finish_escrow(
        &self,
        owner: &str,
        sequence: u32,
        caller: &str,
        fulfillment_hex: Option<&str>,
    ) -> EscrowResult<FinishEscrowOutcome> {
        self.orchestrator
            .finish(owner, sequence, caller, fulfillment_hex)
            .await
    }

    /// Cancel an expired escrow as `caller`.
    pub async fn cancel_escrow(
        &self,
        owner: &str,
        sequence: u32,
        caller: &str,
    ) -> EscrowResult<CancelEscrowOutcome> {
        self.orchestrator.cancel(owner, sequence, caller).await
    }

    /// Read the on-ledger state of an escrow.
    pub async fn escrow_status(&self, owner: &str, sequence: u32) -> EscrowResult<EscrowStatus> {
        self.orchestrator.status(owner, sequence).await
    }

    /// Create a verification-gated escrow; only the condition is returned.
    pub async fn create_qa_escrow(
        &self,
        params: CreateQaEscrowParams,
    ) -> EscrowResult<QaEscrowCreated> {
        let amount_subunits = amount::units_to_subunits(&params.amount_units)?;
        self.gate
            .create_qa_escrow(QaEscrowRequest {
                owner: params.owner,
                destination: params.destination,
                amount_subunits,
                finish_after_unix: params.finish_after_unix,
                cancel_after_unix: params.cancel_after_unix,
                requirements: params.requirements,
            })
            .await
    }

    /// Submit evidence for a gated escrow and release it when everything
    /// verifies.
    pub async fn submit_proof(
        &self,
        sequence: u32,
        submissions: Vec<EvidenceSubmission>,
    ) -> EscrowResult<ProofReport> {
        self.gate.submit_proof(sequence, submissions).await
    }

    /// Current verification bookkeeping for a gated escrow.
    pub async fn requirement_set(&self, sequence: u32) -> EscrowResult<RequirementSet> {
        self.gate.requirement_set(sequence).await
    }

    /// Look up a previously submitted transaction by hash and normalize its
    /// result. Callers use this to resolve an `Unknown` submission outcome
    /// before deciding whether to retry.
    pub async fn reconcile(&self, hash: &str) -> EscrowResult<SubmissionOutcome> {
        let raw = self.gateway.tx(hash).await?;
        Ok(SubmissionOutcome::from_raw(raw))
    }

    /// Drop requirement sets past the configured retention window.
    pub async fn purge_requirements(&self) -> EscrowResult<usize> {
        self.gate
            .purge_expired(ChronoDuration::hours(self.settings.requirement_retention_hours))
            .await
    }
}
