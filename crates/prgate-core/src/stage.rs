//! Stage definitions and outcomes.

use prgate_env::{CommandSpec, StepKind};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::partition::CategoryKind;
use crate::phase::JobPhase;
use crate::runner::TestCounts;

/// What a stage does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "detail")]
pub enum StageAction {
    /// Build the job image on the host, without publishing it.
    BuildImage,
    /// Start the detached job container on the host.
    StartContainer,
    /// Check out the reviewed ref in place.
    Checkout,
    /// Reset, fetch and check out the reviewed ref inside the container.
    SyncSource,
    Provision(StepKind),
    RunCategory(CategoryKind),
    /// The product's cache flush.
    ClearCache,
}

impl StageAction {
    /// Host actions drive the container runtime; all others run inside the
    /// job environment.
    pub fn runs_on_host(&self) -> bool {
        matches!(self, StageAction::BuildImage | StageAction::StartContainer)
    }

    /// How a non-zero exit of this action is reported.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StageAction::BuildImage | StageAction::StartContainer => FailureKind::Build,
            StageAction::Provision(_) => FailureKind::Provisioning,
            StageAction::RunCategory(_) => FailureKind::TestFailure,
            StageAction::Checkout | StageAction::SyncSource | StageAction::ClearCache => {
                FailureKind::Command
            }
        }
    }
}

/// One ordered step of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub phase: JobPhase,
    pub action: StageAction,
    /// Commands run in order; the first non-zero exit ends the stage.
    pub commands: Vec<CommandSpec>,
    /// Worker count (test categories only).
    pub workers: Option<u32>,
    /// Number of tests selected (test categories only).
    pub test_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    /// Not started because an earlier stage failed.
    Skipped,
}

/// Result of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub action: StageAction,
    pub status: StageStatus,
    /// Exit code of the last command run (None when nothing ran).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Attempts made; always 1 unless retries are configured.
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub tests: Option<TestCounts>,
}

impl StageOutcome {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Passed
    }

    pub fn skipped(stage: &Stage) -> Self {
        Self {
            name: stage.name.clone(),
            action: stage.action,
            status: StageStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            attempts: 0,
            failure: None,
            error: None,
            tests: None,
        }
    }

    /// A stage that raised instead of exiting.
    pub fn errored(stage: &Stage, kind: FailureKind, error: String, duration_ms: u64) -> Self {
        Self {
            name: stage.name.clone(),
            action: stage.action,
            status: StageStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            attempts: 1,
            failure: Some(kind),
            error: Some(error),
            tests: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(action: StageAction) -> Stage {
        Stage {
            name: "test_storage".to_string(),
            phase: JobPhase::RunningCategory(1),
            action,
            commands: vec![],
            workers: Some(1),
            test_count: Some(10),
        }
    }

    #[test]
    fn host_actions() {
        assert!(StageAction::BuildImage.runs_on_host());
        assert!(StageAction::StartContainer.runs_on_host());
        assert!(!StageAction::SyncSource.runs_on_host());
        assert!(!StageAction::ClearCache.runs_on_host());
    }

    #[test]
    fn failure_kind_follows_action() {
        assert_eq!(StageAction::BuildImage.failure_kind(), FailureKind::Build);
        assert_eq!(
            StageAction::Provision(StepKind::Runtime).failure_kind(),
            FailureKind::Provisioning
        );
        assert_eq!(
            StageAction::RunCategory(CategoryKind::Storage).failure_kind(),
            FailureKind::TestFailure
        );
    }

    #[test]
    fn skipped_outcome_has_no_attempts() {
        let outcome = StageOutcome::skipped(&stage(StageAction::RunCategory(CategoryKind::Storage)));
        assert_eq!(outcome.status, StageStatus::Skipped);
        assert_eq!(outcome.attempts, 0);
        assert!(!outcome.passed());
    }

    #[test]
    fn action_serializes_with_detail() {
        let json = serde_json::to_value(StageAction::RunCategory(CategoryKind::Daemon)).unwrap();
        assert_eq!(json["action"], "run_category");
        assert_eq!(json["detail"], "daemon");
    }
}
