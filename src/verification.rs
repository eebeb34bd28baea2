//! Verification Gate - attestation-driven automatic release
//!
//! The gate holds, per escrow sequence number, the requirement list and the
//! server-retained condition secret. The counterparty only ever sees the
//! published condition; the preimage and fulfillment stay here until every
//! requirement is verified by the external attestation service, at which
//! point the gate drives the orchestrator's finish path and hands the
//! released funds to the conversion adapter.
//!
//! Requirement state lives behind an explicit [`RequirementStore`] interface
//! rather than a process global, so the "never finish twice" guard is
//! testable in isolation. There is no lock around verification runs; the
//! guard is a re-read of `escrow_finished` immediately before acting, and a
//! rare concurrent double-finish degrades to the orchestrator's benign
//! `NotFound` race.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::condition::ConditionPair;
use crate::conversion::{ConversionAdapter, ConversionOutcome};
use crate::error::{ConditionError, EscrowError};
use crate::escrow::{CreateEscrowRequest, EscrowOrchestrator};
use crate::ledger::SubmissionOutcome;
use crate::EscrowResult;

/// Verdict from the external attestation service. The gate treats this as
/// an oracle and never second-guesses its scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub verified: bool,
    pub confidence: f64,
    pub rationale: String,
}

/// Client for the external attestation service.
#[async_trait]
pub trait AttestationClient: Send + Sync {
    async fn verify(&self, requirement: &str, evidence: &str) -> EscrowResult<Verdict>;
}

/// One requirement the beneficiary must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub id: Uuid,
    pub text: String,
    pub evidence: Option<String>,
    pub verdict: Option<Verdict>,
}

impl Requirement {
    fn new(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            evidence: None,
            verdict: None,
        }
    }

    fn is_verified(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.verified)
    }
}

/// Per-escrow verification bookkeeping, keyed by sequence number.
///
/// `all_verified` and `escrow_finished` are monotonic here; the ledger
/// remains authoritative for the escrow itself. Sets are retained after a
/// successful finish for audit and only removed by explicit purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementSet {
    pub sequence: u32,
    pub owner: String,
    pub destination: String,
    pub requirements: Vec<Requirement>,
    pub all_verified: bool,
    pub escrow_finished: bool,
    /// Server-retained secret material; never exposed to the counterparty.
    pub condition_pair: Option<ConditionPair>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Storage seam for requirement sets.
#[async_trait]
pub trait RequirementStore: Send + Sync {
    async fn get(&self, sequence: u32) -> EscrowResult<Option<RequirementSet>>;
    async fn put(&self, set: RequirementSet) -> EscrowResult<()>;
    async fn delete(&self, sequence: u32) -> EscrowResult<()>;
    /// Remove sets created before `cutoff`; returns how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> EscrowResult<usize>;
}

/// In-memory requirement store (production deployments back this trait with
/// a durable table).
#[derive(Default)]
pub struct MemoryRequirementStore {
    sets: RwLock<HashMap<u32, RequirementSet>>,
}

impl MemoryRequirementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequirementStore for MemoryRequirementStore {
    async fn get(&self, sequence: u32) -> EscrowResult<Option<RequirementSet>> {
        Ok(self.sets.read().await.get(&sequence).cloned())
    }

    async fn put(&self, set: RequirementSet) -> EscrowResult<()> {
        self.sets.write().await.insert(set.sequence, set);
        Ok(())
    }

    async fn delete(&self, sequence: u32) -> EscrowResult<()> {
        self.sets.write().await.remove(&sequence);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> EscrowResult<usize> {
        let mut sets = self.sets.write().await;
        let before = sets.len();
        sets.retain(|_, set| set.created_at >= cutoff);
        Ok(before - sets.len())
    }
}

/// Request to create a verification-gated escrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaEscrowRequest {
    pub owner: String,
    pub destination: String,
    pub amount_subunits: u64,
    pub finish_after_unix: i64,
    pub cancel_after_unix: Option<i64>,
    pub requirements: Vec<String>,
}

/// What the caller gets back: the escrow handle and the publishable
/// condition, never the preimage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaEscrowCreated {
    pub sequence: u32,
    pub condition: String,
    pub outcome: SubmissionOutcome,
}

/// One piece of evidence for one requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    pub requirement_id: Uuid,
    pub evidence: String,
}

/// Result of a proof submission run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofReport {
    pub sequence: u32,
    pub requirements: Vec<Requirement>,
    pub all_verified: bool,
    pub escrow_finished: bool,
    /// Locked amount released by an automatic finish on this run.
    pub released_subunits: Option<u64>,
    pub conversion: Option<ConversionOutcome>,
    /// Why the automatic finish did not go through, when it failed.
    pub finish_error: Option<String>,
    pub conversion_error: Option<String>,
}

/// The verify-then-release driver.
pub struct VerificationGate {
    orchestrator: Arc<EscrowOrchestrator>,
    attestation: Arc<dyn AttestationClient>,
    store: Arc<dyn RequirementStore>,
    conversion: Arc<ConversionAdapter>,
}

impl VerificationGate {
    pub fn new(
        orchestrator: Arc<EscrowOrchestrator>,
        attestation: Arc<dyn AttestationClient>,
        store: Arc<dyn RequirementStore>,
        conversion: Arc<ConversionAdapter>,
    ) -> Self {
        Self {
            orchestrator,
            attestation,
            store,
            conversion,
        }
    }

    /// Create a conditional escrow whose release is gated on requirement
    /// verification. The generated secret stays with this service.
    pub async fn create_qa_escrow(&self, request: QaEscrowRequest) -> EscrowResult<QaEscrowCreated> {
        if request.requirements.is_empty() {
            return Err(EscrowError::validation(
                "requirements",
                "at least one requirement is needed for a verification-gated escrow",
            ));
        }

        let pair = ConditionPair::generate();
        let created = self
            .orchestrator
            .create(CreateEscrowRequest {
                owner: request.owner.clone(),
                destination: request.destination.clone(),
                amount_subunits: request.amount_subunits,
                finish_after_unix: request.finish_after_unix,
                cancel_after_unix: request.cancel_after_unix,
                condition_hex: Some(pair.condition.clone()),
            })
            .await?;

        let set = RequirementSet {
            sequence: created.sequence,
            owner: request.owner,
            destination: request.destination,
            requirements: request.requirements.into_iter().map(Requirement::new).collect(),
            all_verified: false,
            escrow_finished: false,
            condition_pair: Some(pair.clone()),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.store.put(set).await?;

        info!(sequence = created.sequence, "verification-gated escrow created");
        Ok(QaEscrowCreated {
            sequence: created.sequence,
            condition: pair.condition,
            outcome: created.outcome,
        })
    }

    /// Attach evidence, run verification, and release the escrow when every
    /// requirement is verified.
    ///
    /// Verification runs are not deduplicated: a resubmission re-runs the
    /// attestation service and may flip individual verdicts, but
    /// `all_verified`, once latched, never reverts.
    pub async fn submit_proof(
        &self,
        sequence: u32,
        submissions: Vec<EvidenceSubmission>,
    ) -> EscrowResult<ProofReport> {
        let mut set = self
            .store
            .get(sequence)
            .await?
            .ok_or(EscrowError::RequirementsNotFound { sequence })?;

        for submission in submissions {
            let requirement = set
                .requirements
                .iter_mut()
                .find(|r| r.id == submission.requirement_id)
                .ok_or_else(|| {
                    EscrowError::validation(
                        "requirement_id",
                        format!("{} is not part of escrow {sequence}", submission.requirement_id),
                    )
                })?;
            requirement.evidence = Some(submission.evidence);
        }

        for requirement in set.requirements.iter_mut() {
            let Some(evidence) = requirement.evidence.clone() else {
                continue;
            };
            let verdict = self.attestation.verify(&requirement.text, &evidence).await?;
            info!(
                sequence,
                requirement = %requirement.id,
                verified = verdict.verified,
                confidence = verdict.confidence,
                "attestation verdict recorded"
            );
            requirement.verdict = Some(verdict);
        }

        let all_now = set.requirements.iter().all(Requirement::is_verified);
        set.all_verified = set.all_verified || all_now;
        self.store.put(set.clone()).await?;

        let mut released_subunits = None;
        let mut conversion = None;
        let mut finish_error = None;
        let mut conversion_error = None;

        if set.all_verified && !set.escrow_finished {
            // Re-check the flag right before acting; a concurrent run may
            // have finished the escrow since we loaded our snapshot.
            let fresh = self
                .store
                .get(sequence)
                .await?
                .ok_or(EscrowError::RequirementsNotFound { sequence })?;
            if !fresh.escrow_finished {
                match self.release(&mut set).await {
                    Ok(amount) => {
                        released_subunits = Some(amount);
                        match self.conversion.sweep_to_stable(&set.destination).await {
                            Ok(outcome) => conversion = Some(outcome),
                            Err(e) => {
                                error!(sequence, error = %e, "stable-asset sweep failed");
                                conversion_error = Some(e.to_string());
                            }
                        }
                    }
                    Err(EscrowError::NotFound { .. }) => {
                        // Lost the race: the escrow is already settled.
                        warn!(sequence, "escrow already settled by a concurrent finish");
                        set.escrow_finished = true;
                        set.finished_at = Some(Utc::now());
                        self.store.put(set.clone()).await?;
                    }
                    Err(e) => {
                        error!(sequence, error = %e, "automatic finish failed");
                        finish_error = Some(e.to_string());
                    }
                }
            } else {
                set = fresh;
            }
        }

        Ok(ProofReport {
            sequence,
            requirements: set.requirements.clone(),
            all_verified: set.all_verified,
            escrow_finished: set.escrow_finished,
            released_subunits,
            conversion,
            finish_error,
            conversion_error,
        })
    }

    /// Report the current verification bookkeeping for an escrow.
    pub async fn requirement_set(&self, sequence: u32) -> EscrowResult<RequirementSet> {
        self.store
            .get(sequence)
            .await?
            .ok_or(EscrowError::RequirementsNotFound { sequence })
    }

    /// Remove requirement sets older than the retention window.
    pub async fn purge_expired(&self, retention: ChronoDuration) -> EscrowResult<usize> {
        let purged = self.store.purge_older_than(Utc::now() - retention).await?;
        if purged > 0 {
            info!(purged, "expired requirement sets removed");
        }
        Ok(purged)
    }

    async fn release(&self, set: &mut RequirementSet) -> EscrowResult<u64> {
        let pair = set
            .condition_pair
            .clone()
            .ok_or(ConditionError::MissingFulfillment)?;
        let finished = self
            .orchestrator
            .finish(&set.owner, set.sequence, &set.destination, Some(&pair.fulfillment))
            .await?;

        set.escrow_finished = true;
        set.finished_at = Some(Utc::now());
        self.store.put(set.clone()).await?;
        info!(
            sequence = set.sequence,
            amount_subunits = finished.amount_subunits,
            "escrow released after full verification"
        );
        Ok(finished.amount_subunits)
    }
}

/// HTTP client for the attestation service.
pub struct HttpAttestationClient {
    client: reqwest::Client,
    url: String,
}

impl HttpAttestationClient {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> EscrowResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EscrowError::attestation(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AttestationClient for HttpAttestationClient {
    async fn verify(&self, requirement: &str, evidence: &str) -> EscrowResult<Verdict> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "requirement": requirement, "evidence": evidence }))
            .send()
            .await
            .map_err(|e| EscrowError::attestation(format!("verification call failed: {e}")))?;
        response
            .json::<Verdict>()
            .await
            .map_err(|e| EscrowError::attestation(format!("invalid verdict payload: {e}")))
    }
}
