//! Ledger Gateway - owns the connection to the external ledger network
//!
//! The gateway is the one place that talks to the ledger. It keeps at most
//! one live session per process: concurrent callers serialize on the session
//! slot, so whichever caller finds it empty opens the connection while the
//! rest await the same attempt. If a session dies underneath a request, the
//! request reconnects once and retries before propagating the failure.
//!
//! All loosely-typed result shapes from the ledger are normalized into
//! [`SubmissionOutcome`] in exactly one function; nothing outside this module
//! probes nested result objects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::signer::Signer;
use crate::{error::EscrowError, EscrowResult};

/// A live connection to the ledger.
#[async_trait]
pub trait LedgerSession: Send + Sync {
    /// Issue one request and return the ledger's `result` object.
    async fn call(&self, method: &str, params: Value) -> EscrowResult<Value>;

    /// Whether the session is still usable. A session reporting `false`
    /// after a failed call triggers the gateway's reconnect-once path.
    fn is_open(&self) -> bool;
}

/// Opens sessions to the ledger. Implemented by the HTTP transport in
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    async fn open(&self) -> EscrowResult<Arc<dyn LedgerSession>>;
}

/// Human-readable category for a ledger result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeCategory {
    /// `tes*` - applied successfully.
    Success,
    /// `tec*` - failed but claimed the transaction fee.
    FeeClaimed,
    /// `tem*` - malformed transaction, never applied.
    Malformed,
    /// `ter*` - not applied now, could succeed later.
    Retry,
    /// `tef*` - failed, will not succeed as submitted.
    Failed,
    /// `tel*` - local server error.
    LocalError,
    /// Anything the classifier does not recognize.
    Other,
}

impl OutcomeCategory {
    pub fn from_code(code: &str) -> Self {
        match code.get(..3) {
            Some("tes") => Self::Success,
            Some("tec") => Self::FeeClaimed,
            Some("tem") => Self::Malformed,
            Some("ter") => Self::Retry,
            Some("tef") => Self::Failed,
            Some("tel") => Self::LocalError,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "applied successfully",
            Self::FeeClaimed => "failed, transaction fee claimed",
            Self::Malformed => "malformed transaction",
            Self::Retry => "not applied, retryable",
            Self::Failed => "failed as submitted",
            Self::LocalError => "local server error",
            Self::Other => "unrecognized result code",
        };
        f.write_str(text)
    }
}

/// Normalized outcome of one ledger submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    /// Raw result code, verbatim from the ledger.
    pub code: String,
    /// Human-readable classification of `code`.
    pub category: OutcomeCategory,
    /// Transaction hash, when reported.
    pub hash: Option<String>,
    /// Whether the result comes from a validated ledger.
    pub validated: bool,
    /// The full raw result for diagnostics.
    pub raw: Value,
}

impl SubmissionOutcome {
    /// Normalize a raw submission result. This is the only place that
    /// inspects the ledger's nested result shapes.
    pub fn from_raw(raw: Value) -> Self {
        let code = raw
            .get("engine_result")
            .and_then(Value::as_str)
            .or_else(|| {
                raw.get("meta")
                    .and_then(|m| m.get("TransactionResult"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("unknown")
            .to_string();
        let hash = raw
            .get("tx_json")
            .and_then(|t| t.get("hash"))
            .and_then(Value::as_str)
            .or_else(|| raw.get("hash").and_then(Value::as_str))
            .map(str::to_string);
        let validated = raw.get("validated").and_then(Value::as_bool).unwrap_or(false);
        let category = OutcomeCategory::from_code(&code);

        Self {
            code,
            category,
            hash,
            validated,
            raw,
        }
    }

    pub fn is_success(&self) -> bool {
        self.category == OutcomeCategory::Success
    }

    /// The account sequence the transaction consumed, when reported. For an
    /// escrow creation this is the ledger-assigned escrow handle.
    pub fn consumed_sequence(&self) -> Option<u32> {
        self.raw
            .get("tx_json")
            .and_then(|t| t.get("Sequence"))
            .and_then(Value::as_u64)
            .map(|s| s as u32)
    }
}

/// The process-wide ledger connection owner.
pub struct LedgerGateway {
    transport: Arc<dyn LedgerTransport>,
    session: Mutex<Option<Arc<dyn LedgerSession>>>,
    request_timeout: Duration,
    fee_subunits: u64,
}

impl LedgerGateway {
    pub fn new(
        transport: Arc<dyn LedgerTransport>,
        request_timeout: Duration,
        fee_subunits: u64,
    ) -> Self {
        Self {
            transport,
            session: Mutex::new(None),
            request_timeout,
            fee_subunits,
        }
    }

    /// Get the live session, opening one if needed. Callers arriving while a
    /// connection attempt is in flight await the same attempt via the slot
    /// mutex instead of racing to open duplicates.
    async fn session(&self) -> EscrowResult<Arc<dyn LedgerSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
            *slot = None;
        }
        let session = self.transport.open().await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop the stored session if it is still the one we used.
    async fn evict(&self, dead: &Arc<dyn LedgerSession>) {
        let mut slot = self.session.lock().await;
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, dead) {
                *slot = None;
            }
        }
    }

    /// Issue a query with a bounded timeout, transparently reconnecting once
    /// if the session died underneath the request.
    pub async fn request(&self, method: &str, params: Value) -> EscrowResult<Value> {
        let session = self.session().await?;
        match timeout(self.request_timeout, session.call(method, params.clone())).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) if !session.is_open() => {
                warn!(%method, error = %e, "ledger session lost, reconnecting once");
                self.evict(&session).await;
                let fresh = self.session().await?;
                match timeout(self.request_timeout, fresh.call(method, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(EscrowError::transport(format!("{method} timed out"))),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EscrowError::transport(format!("{method} timed out"))),
        }
    }

    /// Fetch the escrow ledger entry for `(owner, sequence)`, if present.
    pub async fn escrow_entry(&self, owner: &str, sequence: u32) -> EscrowResult<Option<Value>> {
        let result = self
            .request(
                "ledger_entry",
                json!({
                    "escrow": { "owner": owner, "seq": sequence },
                    "ledger_index": "validated",
                }),
            )
            .await?;
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            if error == "entryNotFound" {
                return Ok(None);
            }
            return Err(EscrowError::transport(format!("ledger_entry failed: {error}")));
        }
        Ok(Some(result.get("node").cloned().unwrap_or(result)))
    }

    /// Fetch account state (balance, sequence, owner count).
    pub async fn account_info(&self, account: &str) -> EscrowResult<Value> {
        let result = self
            .request(
                "account_info",
                json!({ "account": account, "ledger_index": "validated" }),
            )
            .await?;
        reject_result_error("account_info", &result)?;
        Ok(result)
    }

    /// Fetch the account's trust lines.
    pub async fn account_lines(&self, account: &str) -> EscrowResult<Value> {
        let result = self
            .request("account_lines", json!({ "account": account }))
            .await?;
        reject_result_error("account_lines", &result)?;
        Ok(result)
    }

    /// Fetch server state (reserve requirements).
    pub async fn server_state(&self) -> EscrowResult<Value> {
        self.request("server_state", json!({})).await
    }

    /// Look up a transaction by hash. This is the reconciliation path after
    /// an `Unknown` submission outcome: the result says whether the
    /// transaction landed.
    pub async fn tx(&self, hash: &str) -> EscrowResult<Value> {
        let result = self.request("tx", json!({ "transaction": hash })).await?;
        reject_result_error("tx", &result)?;
        Ok(result)
    }

    /// Sign and submit a transaction, waiting for a validated result.
    ///
    /// Fills `Sequence` (from account state) and `Fee` when the caller left
    /// them unset. A timeout or in-flight transport failure maps to
    /// [`EscrowError::Unknown`]: the transaction may still land, so callers
    /// must reconcile via a status read before retrying.
    pub async fn submit_and_wait(
        &self,
        mut tx: Value,
        signer: &dyn Signer,
    ) -> EscrowResult<SubmissionOutcome> {
        if tx.get("Sequence").is_none() {
            let account = tx
                .get("Account")
                .and_then(Value::as_str)
                .ok_or_else(|| EscrowError::transport("transaction missing Account"))?
                .to_string();
            let info = self.account_info(&account).await?;
            let sequence = info
                .get("account_data")
                .and_then(|d| d.get("Sequence"))
                .and_then(Value::as_u64)
                .ok_or_else(|| EscrowError::transport("account_info missing Sequence"))?;
            tx["Sequence"] = json!(sequence);
        }
        if tx.get("Fee").is_none() {
            tx["Fee"] = json!(self.fee_subunits.to_string());
        }

        let blob = signer.sign(&tx).await?;
        let session = self.session().await?;
        match timeout(
            self.request_timeout,
            session.call("submit", json!({ "tx_blob": blob })),
        )
        .await
        {
            Ok(Ok(raw)) => {
                let outcome = SubmissionOutcome::from_raw(raw);
                info!(
                    code = %outcome.code,
                    validated = outcome.validated,
                    tx_type = tx.get("TransactionType").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    "ledger submission result"
                );
                Ok(outcome)
            }
            // No automatic retry here: the transaction may already be in
            // flight, and a resubmission could double-move funds.
            Ok(Err(e)) => Err(EscrowError::unknown(format!(
                "transport failed mid-submission: {e}"
            ))),
            Err(_) => Err(EscrowError::unknown(
                "submission timed out awaiting validation",
            )),
        }
    }
}

fn reject_result_error(method: &str, result: &Value) -> EscrowResult<()> {
    if let Some(error) = result.get("error").and_then(Value::as_str) {
        return Err(EscrowError::transport(format!("{method} failed: {error}")));
    }
    Ok(())
}

/// JSON-RPC-over-HTTP transport to a ledger endpoint.
pub struct HttpTransport {
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl LedgerTransport for HttpTransport {
    async fn open(&self) -> EscrowResult<Arc<dyn LedgerSession>> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EscrowError::transport(e.to_string()))?;
        let session = Arc::new(HttpSession {
            client,
            url: self.url.clone(),
        });
        // Liveness probe so a dead endpoint fails at connect, not mid-operation.
        session.call("server_state", json!({})).await?;
        Ok(session)
    }
}

struct HttpSession {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl LedgerSession for HttpSession {
    async fn call(&self, method: &str, params: Value) -> EscrowResult<Value> {
        let body = json!({ "method": method, "params": [params] });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EscrowError::transport(format!("{method}: {e}")))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| EscrowError::transport(format!("{method}: invalid response: {e}")))?;
        Ok(value.get("result").cloned().unwrap_or(value))
    }

    fn is_open(&self) -> bool {
        // HTTP sessions are stateless per request; reqwest re-dials as needed.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn classifies_result_codes() {
        assert_eq!(OutcomeCategory::from_code("tesSUCCESS"), OutcomeCategory::Success);
        assert_eq!(OutcomeCategory::from_code("tecNO_PERMISSION"), OutcomeCategory::FeeClaimed);
        assert_eq!(OutcomeCategory::from_code("temMALFORMED"), OutcomeCategory::Malformed);
        assert_eq!(OutcomeCategory::from_code("terQUEUED"), OutcomeCategory::Retry);
        assert_eq!(OutcomeCategory::from_code("tefPAST_SEQ"), OutcomeCategory::Failed);
        assert_eq!(OutcomeCategory::from_code("telINSUF_FEE_P"), OutcomeCategory::LocalError);
        assert_eq!(OutcomeCategory::from_code(""), OutcomeCategory::Other);
    }

    #[test]
    fn normalizes_engine_result_shape() {
        let raw = json!({
            "engine_result": "tesSUCCESS",
            "validated": true,
            "tx_json": { "hash": "ABC", "Sequence": 42 },
        });
        let outcome = SubmissionOutcome::from_raw(raw);
        assert!(outcome.is_success());
        assert!(outcome.validated);
        assert_eq!(outcome.hash.as_deref(), Some("ABC"));
        assert_eq!(outcome.consumed_sequence(), Some(42));
    }

    #[test]
    fn normalizes_meta_result_shape() {
        let raw = json!({
            "meta": { "TransactionResult": "tecNO_TARGET" },
            "hash": "DEF",
        });
        let outcome = SubmissionOutcome::from_raw(raw);
        assert_eq!(outcome.code, "tecNO_TARGET");
        assert_eq!(outcome.category, OutcomeCategory::FeeClaimed);
        assert_eq!(outcome.hash.as_deref(), Some("DEF"));
        assert!(!outcome.validated);
    }

    struct CountingSession {
        broken: AtomicBool,
        fail_next: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl LedgerSession for CountingSession {
        async fn call(&self, _method: &str, _params: Value) -> EscrowResult<Value> {
            tokio::time::sleep(self.delay).await;
            if self.fail_next.swap(false, Ordering::SeqCst) {
                self.broken.store(true, Ordering::SeqCst);
                return Err(EscrowError::transport("connection reset"));
            }
            Ok(json!({ "ok": true }))
        }

        fn is_open(&self) -> bool {
            !self.broken.load(Ordering::SeqCst)
        }
    }

    struct CountingTransport {
        opens: AtomicUsize,
        open_delay: Duration,
        fail_first_call: AtomicBool,
        call_delay: Duration,
    }

    impl CountingTransport {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                open_delay: Duration::from_millis(20),
                fail_first_call: AtomicBool::new(false),
                call_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LedgerTransport for CountingTransport {
        async fn open(&self) -> EscrowResult<Arc<dyn LedgerSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.open_delay).await;
            Ok(Arc::new(CountingSession {
                broken: AtomicBool::new(false),
                fail_next: AtomicBool::new(self.fail_first_call.swap(false, Ordering::SeqCst)),
                delay: self.call_delay,
            }))
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connection_attempt() {
        let transport = Arc::new(CountingTransport::new());
        let gateway = Arc::new(LedgerGateway::new(
            transport.clone(),
            Duration::from_secs(1),
            12,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gw = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gw.request("server_state", json!({})).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_session_reconnects_once_transparently() {
        let transport = Arc::new(CountingTransport::new());
        transport.fail_first_call.store(true, Ordering::SeqCst);
        let gateway = LedgerGateway::new(transport.clone(), Duration::from_secs(1), 12);

        // First call hits the poisoned session, which dies; the gateway
        // reconnects once and the call still succeeds.
        let result = gateway.request("server_state", json!({})).await.unwrap();
        assert_eq!(result["ok"], json!(true));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn query_timeout_is_a_transport_error() {
        let mut transport = CountingTransport::new();
        transport.call_delay = Duration::from_millis(200);
        let gateway = LedgerGateway::new(Arc::new(transport), Duration::from_millis(20), 12);

        assert!(matches!(
            gateway.request("server_state", json!({})).await,
            Err(EscrowError::Transport(_))
        ));
    }

    struct NullSigner;

    #[async_trait]
    impl Signer for NullSigner {
        fn address(&self) -> &str {
            "rService"
        }

        async fn sign(&self, tx: &Value) -> EscrowResult<String> {
            Ok(hex::encode_upper(tx.to_string()))
        }
    }

    #[tokio::test]
    async fn submission_timeout_is_unknown_not_failed() {
        let mut transport = CountingTransport::new();
        transport.call_delay = Duration::from_millis(200);
        let gateway = LedgerGateway::new(Arc::new(transport), Duration::from_millis(20), 12);

        let tx = json!({
            "TransactionType": "EscrowCancel",
            "Account": "rService",
            "Sequence": 1,
        });
        assert!(matches!(
            gateway.submit_and_wait(tx, &NullSigner).await,
            Err(EscrowError::Unknown { .. })
        ));
    }
}
