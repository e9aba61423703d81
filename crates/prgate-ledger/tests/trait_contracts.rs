//! Trait contract tests for RunLedger.
//!
//! Every backend must pass the same behavioral contract, so each test runs
//! against both the in-memory fake and the filesystem ledger.

use chrono::Utc;
use prgate_ledger::storage_traits::*;
use prgate_ledger::{FsRunLedger, MemoryRunLedger, StorageError};
use serde_json::json;

fn metadata(job: &str) -> RunMetadata {
    RunMetadata {
        git_sha: Some("deadbeef".to_string()),
        job_name: job.to_string(),
        tags: json!({ "product_version": "1.0.0" }),
    }
}

fn event(seq: u64, kind: &str) -> RunEvent {
    RunEvent {
        seq,
        kind: kind.to_string(),
        payload: json!({ "stage": format!("stage-{seq}") }),
        timestamp: Utc::now(),
    }
}

fn summary(success: bool) -> RunSummary {
    RunSummary {
        total_events: 2,
        duration_ms: 42,
        success,
    }
}

async fn create_then_get(ledger: &dyn RunLedger) {
    let digest = ContentDigest::from_bytes(b"plan-a");
    let run_id = ledger.create_run(&digest, metadata("bare-metal")).await.unwrap();

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.run_id, run_id);
    assert_eq!(record.plan_digest, digest);
    assert_eq!(record.status, RunStatus::Running);
    assert!(record.summary.is_none());
    assert_eq!(record.metadata.job_name, "bare-metal");
}

async fn events_are_returned_in_order(ledger: &dyn RunLedger) {
    let digest = ContentDigest::from_bytes(b"plan-b");
    let run_id = ledger.create_run(&digest, metadata("bare-metal")).await.unwrap();
    ledger.append_event(&run_id, event(1, "stage_started")).await.unwrap();
    ledger.append_event(&run_id, event(2, "stage_passed")).await.unwrap();

    let events = ledger.get_events(&run_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[1].kind, "stage_passed");
}

async fn finished_run_is_immutable(ledger: &dyn RunLedger) {
    let digest = ContentDigest::from_bytes(b"plan-c");
    let run_id = ledger.create_run(&digest, metadata("container")).await.unwrap();
    ledger.fail_run(&run_id, summary(false)).await.unwrap();

    let err = ledger
        .append_event(&run_id, event(1, "stage_started"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let err = ledger.complete_run(&run_id, summary(true)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let record = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.completed_at.is_some());
}

async fn seq_must_increase(ledger: &dyn RunLedger) {
    let digest = ContentDigest::from_bytes(b"plan-d");
    let run_id = ledger.create_run(&digest, metadata("bare-metal")).await.unwrap();
    ledger.append_event(&run_id, event(3, "stage_started")).await.unwrap();

    let err = ledger
        .append_event(&run_id, event(3, "stage_passed"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NonMonotonicSeq { seq: 3, last: 3, .. }));
}

async fn unknown_run_is_not_found(ledger: &dyn RunLedger) {
    let missing = RunId::new();
    assert!(matches!(
        ledger.get_run(&missing).await.unwrap_err(),
        StorageError::RunNotFound { .. }
    ));
    assert!(matches!(
        ledger.get_events(&missing).await.unwrap_err(),
        StorageError::RunNotFound { .. }
    ));
}

async fn list_filters_by_digest(ledger: &dyn RunLedger) {
    let a = ContentDigest::from_bytes(b"list-a");
    let b = ContentDigest::from_bytes(b"list-b");
    ledger.create_run(&a, metadata("bare-metal")).await.unwrap();
    ledger.create_run(&a, metadata("container")).await.unwrap();
    ledger.create_run(&b, metadata("bare-metal")).await.unwrap();

    assert_eq!(ledger.list_runs(Some(&a)).await.unwrap().len(), 2);
    assert_eq!(ledger.list_runs(Some(&b)).await.unwrap().len(), 1);
    assert!(ledger.list_runs(None).await.unwrap().len() >= 3);
}

macro_rules! contract_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let ledger = MemoryRunLedger::new();
                    super::$name(&ledger).await;
                }
            )*
        }

        mod filesystem {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let dir = tempfile::tempdir().unwrap();
                    let ledger = FsRunLedger::new(dir.path()).unwrap();
                    super::$name(&ledger).await;
                }
            )*
        }
    };
}

contract_tests!(
    create_then_get,
    events_are_returned_in_order,
    finished_run_is_immutable,
    seq_must_increase,
    unknown_run_is_not_found,
    list_filters_by_digest,
);
