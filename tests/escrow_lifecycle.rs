//! End-to-end lifecycle scenarios over the shared mock ledger.

mod common;

use std::time::Duration;

use anyhow::Result;

use ledger_escrow::condition;
use ledger_escrow::error::{ConditionError, EscrowError, TimingError};
use ledger_escrow::ledger_time::now_unix;
use ledger_escrow::node::{CreateEscrowParams, CreateQaEscrowParams};
use ledger_escrow::verification::EvidenceSubmission;

use common::{node_over, MockLedger, DEST, OWNER};

#[tokio::test]
async fn time_locked_escrow_releases_after_the_floor() -> Result<()> {
    let ledger = MockLedger::default();
    let node = node_over(&ledger);

    let created = node
        .create_escrow(CreateEscrowParams {
            owner: OWNER.to_string(),
            destination: DEST.to_string(),
            amount_units: "10".to_string(),
            finish_after_unix: now_unix() + 2,
            cancel_after_unix: None,
            condition_hex: None,
        })
        .await?;

    let status = node.escrow_status(OWNER, created.sequence).await?;
    assert_eq!(status.amount_subunits, 10_000_000);
    assert_eq!(status.destination, DEST);

    // Before the floor: rejected locally, nothing reaches the ledger.
    let err = node
        .finish_escrow(OWNER, created.sequence, DEST, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Timing(TimingError::TooEarly { .. })));
    assert_eq!(ledger.finishes(), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let finished = node.finish_escrow(OWNER, created.sequence, DEST, None).await?;
    assert_eq!(finished.amount_subunits, 10_000_000);
    assert_eq!(ledger.finishes(), 1);

    // The entry is consumed.
    assert!(matches!(
        node.escrow_status(OWNER, created.sequence).await,
        Err(EscrowError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn expired_escrow_returns_to_the_owner() -> Result<()> {
    let ledger = MockLedger::default();
    let node = node_over(&ledger);

    let created = node
        .create_escrow(CreateEscrowParams {
            owner: OWNER.to_string(),
            destination: DEST.to_string(),
            amount_units: "5".to_string(),
            finish_after_unix: now_unix() + 1,
            cancel_after_unix: Some(now_unix() + 2),
            condition_hex: None,
        })
        .await?;

    // Only the owner may cancel, and only after the window opens.
    assert!(matches!(
        node.cancel_escrow(OWNER, created.sequence, DEST).await,
        Err(EscrowError::Authorization { .. })
    ));
    assert!(matches!(
        node.cancel_escrow(OWNER, created.sequence, OWNER).await,
        Err(EscrowError::Timing(TimingError::TooEarly { .. }))
    ));

    tokio::time::sleep(Duration::from_secs(3)).await;

    node.cancel_escrow(OWNER, created.sequence, OWNER).await?;
    assert!(matches!(
        node.escrow_status(OWNER, created.sequence).await,
        Err(EscrowError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn qa_escrow_releases_only_after_full_verification() -> Result<()> {
    let ledger = MockLedger::default();
    let node = node_over(&ledger);

    let created = node
        .create_qa_escrow(CreateQaEscrowParams {
            owner: OWNER.to_string(),
            destination: DEST.to_string(),
            amount_units: "25".to_string(),
            finish_after_unix: now_unix() + 3600,
            cancel_after_unix: None,
            requirements: vec![
                "unit tests pass".to_string(),
                "docs updated".to_string(),
                "demo deployed".to_string(),
            ],
        })
        .await?;

    // A forged fulfillment is rejected locally; the mock never sees a finish.
    let forged = hex::encode_upper(condition::build_fulfillment(&condition::generate_secret()));
    let err = node
        .finish_escrow(OWNER, created.sequence, DEST, Some(&forged))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EscrowError::Condition(ConditionError::FulfillmentMismatch)
    ));
    assert_eq!(ledger.finishes(), 0);

    // Two of three requirements verified: no release.
    let set = node.requirement_set(created.sequence).await?;
    let evidence = |text: &str, body: &str| EvidenceSubmission {
        requirement_id: set
            .requirements
            .iter()
            .find(|r| r.text == text)
            .unwrap()
            .id,
        evidence: body.to_string(),
    };
    let report = node
        .submit_proof(
            created.sequence,
            vec![
                evidence("unit tests pass", "pass: 212 green"),
                evidence("docs updated", "pass: changelog and book"),
                evidence("demo deployed", "still building"),
            ],
        )
        .await?;
    assert!(!report.all_verified);
    assert!(!report.escrow_finished);
    assert_eq!(ledger.finishes(), 0);

    // Resubmitting the failing requirement completes verification and
    // triggers the automatic finish exactly once.
    let report = node
        .submit_proof(
            created.sequence,
            vec![evidence("demo deployed", "pass: live at demo.example")],
        )
        .await?;
    assert!(report.all_verified);
    assert!(report.escrow_finished);
    assert_eq!(report.released_subunits, Some(25_000_000));
    assert_eq!(ledger.finishes(), 1);

    // Released funds were swept toward the stable asset.
    let conversion = report.conversion.expect("sweep ran");
    assert!(conversion.attempted);
    assert_eq!(conversion.delivered_units.as_deref(), Some("87"));

    // The escrow is gone and a repeat proof run does not finish again.
    assert!(matches!(
        node.escrow_status(OWNER, created.sequence).await,
        Err(EscrowError::NotFound { .. })
    ));
    let report = node.submit_proof(created.sequence, Vec::new()).await?;
    assert!(report.escrow_finished);
    assert_eq!(report.released_subunits, None);
    assert_eq!(ledger.finishes(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_outcomes_reconcile_by_hash() -> Result<()> {
    let ledger = MockLedger::default();
    let node = node_over(&ledger);

    let outcome = node.reconcile("DEADBEEF").await?;
    assert!(outcome.is_success());
    assert!(outcome.validated);
    Ok(())
}
