//! Job lifecycle adapter: turns stage events into `RunLedger` records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use prgate_ledger::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult,
};
use serde::Serialize;

use crate::error::FailureKind;
use crate::runner::TestCounts;
use crate::telemetry;

/// Events recorded for a job run. The serde tag becomes the ledger event
/// kind; the remaining fields become the payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StageStarted {
        stage: String,
        phase: String,
        commands: Vec<String>,
    },
    StagePassed {
        stage: String,
        exit_code: Option<i32>,
        duration_ms: u64,
        attempts: u32,
        tests: Option<TestCounts>,
    },
    StageFailed {
        stage: String,
        exit_code: Option<i32>,
        failure: FailureKind,
        error: Option<String>,
        stdout: String,
        stderr: String,
        duration_ms: u64,
        attempts: u32,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    ExclusionNoted {
        category: String,
        test: String,
        reason: String,
    },
}

impl JobEvent {
    fn into_parts(self) -> (String, serde_json::Value) {
        let mut value = serde_json::to_value(&self).unwrap_or_default();
        let kind = value
            .as_object_mut()
            .and_then(|obj| obj.remove("type"))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        (kind, value)
    }
}

/// Records one job run.
///
/// 1. [`JobRecorder::start`] creates the run.
/// 2. [`JobRecorder::record`] appends events with increasing `seq`.
/// 3. [`JobRecorder::finish_ok`] or [`JobRecorder::finish_err`] finalises it.
pub struct JobRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    job: String,
    seq: AtomicU64,
}

impl JobRecorder {
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        plan_digest: &ContentDigest,
        metadata: RunMetadata,
        stages: usize,
    ) -> StorageResult<Self> {
        let job = metadata.job_name.clone();
        let run_id = ledger.create_run(plan_digest, metadata).await?;
        telemetry::emit_job_started(&run_id.0, &job, plan_digest.short(), stages);
        Ok(Self {
            ledger,
            run_id,
            job,
            seq: AtomicU64::new(0),
        })
    }

    pub async fn record(&self, event: JobEvent) -> StorageResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (kind, payload) = event.into_parts();
        tracing::debug!(run_id = %self.run_id, kind = %kind, seq = seq, "event appended");
        self.ledger
            .append_event(
                &self.run_id,
                RunEvent {
                    seq,
                    kind,
                    payload,
                    timestamp: Utc::now(),
                },
            )
            .await
    }

    pub fn events_recorded(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub async fn finish_ok(self, duration_ms: u64) -> StorageResult<()> {
        let summary = self.summary(duration_ms, true);
        telemetry::emit_job_finished(&self.run_id.0, &self.job, duration_ms, true);
        self.ledger.complete_run(&self.run_id, summary).await
    }

    pub async fn finish_err(self, duration_ms: u64) -> StorageResult<()> {
        let summary = self.summary(duration_ms, false);
        telemetry::emit_job_finished(&self.run_id.0, &self.job, duration_ms, false);
        self.ledger.fail_run(&self.run_id, summary).await
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn summary(&self, duration_ms: u64, success: bool) -> RunSummary {
        RunSummary {
            total_events: self.events_recorded(),
            duration_ms,
            success,
        }
    }
}
