//! Tracing initialisation and lifecycle events.
//!
//! Call [`init_tracing`] once at program start. The `emit_*` helpers log the
//! job lifecycle with stable `event` names so JSON output can be filtered
//! by them.

use tracing::{info, warn, Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON log lines.
/// * `level` - default verbosity when `RUST_LOG` is not set.
///
/// Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

/// Job-scoped span. Attach it to the job future with
/// `tracing::Instrument::instrument`; entering it across awaits is not
/// supported.
pub struct JobSpan {
    span: Span,
}

impl JobSpan {
    pub fn new(job: &str, run_id: &str) -> Self {
        Self {
            span: tracing::info_span!("prgate.job", job = %job, run_id = %run_id),
        }
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }
}

pub fn emit_job_started(run_id: &str, job: &str, plan_digest: &str, stages: usize) {
    info!(
        event = "job.started",
        run_id = %run_id,
        job = %job,
        plan_digest = %plan_digest,
        stages = stages,
    );
}

pub fn emit_stage_finished(stage: &str, status: &str, exit_code: Option<i32>, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        status = %status,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Warn level: retries are never silent.
pub fn emit_stage_retry(stage: &str, attempt: u32, max_retries: u32, error: &str) {
    warn!(
        event = "stage.retry",
        stage = %stage,
        attempt = attempt,
        max_retries = max_retries,
        error = %error,
    );
}

pub fn emit_job_finished(run_id: &str, job: &str, duration_ms: u64, passed: bool) {
    info!(
        event = "job.finished",
        run_id = %run_id,
        job = %job,
        duration_ms = duration_ms,
        passed = passed,
    );
}

pub fn emit_gate_evaluated(jobs: usize, drift: usize, passed: bool) {
    info!(
        event = "gate.evaluated",
        jobs = jobs,
        drift = drift,
        passed = passed,
    );
}

/// Warn level: the run's ledger record could not be finalised.
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_span_can_be_entered() {
        let span = JobSpan::new("bare-metal", "run-1");
        let _entered = span.span().entered();
        emit_stage_finished("test_general", "passed", Some(0), 5);
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
