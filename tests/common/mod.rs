//! Shared in-memory ledger mock for the lifecycle tests.
//!
//! Unlike the per-module unit fakes, this mock enforces the ledger's own
//! rules on finish: the entry must exist and, for a conditional escrow, the
//! submitted fulfillment must re-derive the stored condition.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use ledger_escrow::condition;
use ledger_escrow::config::Settings;
use ledger_escrow::ledger::{LedgerSession, LedgerTransport};
use ledger_escrow::node::EscrowNode;
use ledger_escrow::signer::{Signer, SignerProvider, StaticSignerProvider};
use ledger_escrow::verification::{AttestationClient, MemoryRequirementStore, Verdict};
use ledger_escrow::EscrowResult;

pub const OWNER: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
pub const DEST: &str = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";

#[derive(Default)]
pub struct MockState {
    entries: Mutex<HashMap<(String, u32), Value>>,
    sequences: Mutex<HashMap<String, u64>>,
    trustlines: Mutex<HashSet<String>>,
    finishes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockLedger {
    state: Arc<MockState>,
}

impl MockLedger {
    pub fn finishes(&self) -> usize {
        self.state.finishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerTransport for MockLedger {
    async fn open(&self) -> EscrowResult<Arc<dyn LedgerSession>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl LedgerSession for MockLedger {
    async fn call(&self, method: &str, params: Value) -> EscrowResult<Value> {
        match method {
            "ledger_entry" => {
                let owner = params["escrow"]["owner"].as_str().unwrap().to_string();
                let seq = params["escrow"]["seq"].as_u64().unwrap() as u32;
                match self.state.entries.lock().unwrap().get(&(owner, seq)) {
                    Some(entry) => Ok(json!({ "node": entry })),
                    None => Ok(json!({ "error": "entryNotFound" })),
                }
            }
            "account_info" => {
                let account = params["account"].as_str().unwrap();
                let seq = *self
                    .state
                    .sequences
                    .lock()
                    .unwrap()
                    .entry(account.to_string())
                    .or_insert(1);
                Ok(json!({
                    "account_data": {
                        "Sequence": seq,
                        "Balance": "100000000",
                        "OwnerCount": 0,
                    }
                }))
            }
            "account_lines" => {
                let account = params["account"].as_str().unwrap();
                let lines = if self.state.trustlines.lock().unwrap().contains(account) {
                    json!([{
                        "currency": "USD",
                        "account": Settings::default().conversion.stable_issuer,
                    }])
                } else {
                    json!([])
                };
                Ok(json!({ "lines": lines }))
            }
            "server_state" => Ok(json!({
                "state": {
                    "validated_ledger": { "reserve_base": 10_000_000, "reserve_inc": 2_000_000 }
                }
            })),
            "tx" => Ok(json!({
                "meta": { "TransactionResult": "tesSUCCESS" },
                "validated": true,
                "hash": params["transaction"],
            })),
            "submit" => {
                let blob = params["tx_blob"].as_str().unwrap();
                let tx: Value = serde_json::from_slice(&hex::decode(blob).unwrap()).unwrap();
                self.apply(tx)
            }
            other => panic!("unexpected method {other}"),
        }
    }

    fn is_open(&self) -> bool {
        true
    }
}

impl MockLedger {
    fn apply(&self, tx: Value) -> EscrowResult<Value> {
        let account = tx["Account"].as_str().unwrap().to_string();
        let code = match tx["TransactionType"].as_str().unwrap() {
            "EscrowCreate" => {
                let sequence = tx["Sequence"].as_u64().unwrap();
                let mut entry = tx.clone();
                entry.as_object_mut().unwrap().remove("Sequence");
                self.state
                    .entries
                    .lock()
                    .unwrap()
                    .insert((account.clone(), sequence as u32), entry);
                "tesSUCCESS"
            }
            "EscrowFinish" => {
                let owner = tx["Owner"].as_str().unwrap().to_string();
                let offer = tx["OfferSequence"].as_u64().unwrap() as u32;
                let mut entries = self.state.entries.lock().unwrap();
                match entries.get(&(owner.clone(), offer)) {
                    None => "tecNO_TARGET",
                    Some(entry) => {
                        // Re-derive the condition from the fulfillment, as
                        // the real ledger does.
                        let satisfied = match entry.get("Condition").and_then(Value::as_str) {
                            None => true,
                            Some(cond) => tx
                                .get("Fulfillment")
                                .and_then(Value::as_str)
                                .is_some_and(|f| condition::fulfillment_matches(f, cond).is_ok()),
                        };
                        if satisfied {
                            entries.remove(&(owner, offer));
                            self.state.finishes.fetch_add(1, Ordering::SeqCst);
                            "tesSUCCESS"
                        } else {
                            "tecCRYPTOCONDITION"
                        }
                    }
                }
            }
            "EscrowCancel" => {
                let owner = tx["Owner"].as_str().unwrap().to_string();
                let offer = tx["OfferSequence"].as_u64().unwrap() as u32;
                if self.state.entries.lock().unwrap().remove(&(owner, offer)).is_some() {
                    "tesSUCCESS"
                } else {
                    "tecNO_TARGET"
                }
            }
            "TrustSet" => {
                self.state.trustlines.lock().unwrap().insert(account.clone());
                "tesSUCCESS"
            }
            "Payment" => "tesSUCCESS",
            other => panic!("unexpected transaction type {other}"),
        };
        *self
            .state
            .sequences
            .lock()
            .unwrap()
            .entry(account)
            .or_insert(1) += 1;

        let mut result = json!({
            "engine_result": code,
            "validated": true,
            "tx_json": tx,
        });
        if code == "tesSUCCESS" && result["tx_json"]["TransactionType"] == "Payment" {
            result["meta"] = json!({ "delivered_amount": { "value": "87" } });
        }
        Ok(result)
    }
}

struct EchoSigner {
    address: String,
}

#[async_trait]
impl Signer for EchoSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, tx: &Value) -> EscrowResult<String> {
        Ok(hex::encode_upper(tx.to_string()))
    }
}

/// Attestation stub: evidence mentioning "pass" verifies.
struct KeywordAttestation;

#[async_trait]
impl AttestationClient for KeywordAttestation {
    async fn verify(&self, _requirement: &str, evidence: &str) -> EscrowResult<Verdict> {
        let verified = evidence.contains("pass");
        Ok(Verdict {
            verified,
            confidence: if verified { 0.95 } else { 0.2 },
            rationale: "keyword check".to_string(),
        })
    }
}

/// A full node over the mock ledger, with no creation lead time so the
/// lifecycle tests can work with short real-time windows.
pub fn node_over(ledger: &MockLedger) -> EscrowNode {
    ledger_escrow::init_tracing();
    let settings = Settings {
        min_finish_lead_secs: 0,
        request_timeout_secs: 5,
        ..Settings::default()
    };
    let signers: Arc<dyn SignerProvider> = Arc::new(
        StaticSignerProvider::new()
            .with_signer(Arc::new(EchoSigner { address: OWNER.into() }))
            .with_signer(Arc::new(EchoSigner { address: DEST.into() })),
    );
    EscrowNode::with_parts(
        settings,
        Arc::new(ledger.clone()),
        signers,
        Arc::new(KeywordAttestation),
        Arc::new(MemoryRequirementStore::new()),
    )
}
