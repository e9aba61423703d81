//! Gate evaluation.
//!
//! A job passes iff every stage passed and none was skipped. The pull-request
//! gate passes iff every required job passed. Verdicts are computed per job
//! and never merged before the final decision, so a category that behaves
//! differently on the two targets shows up as drift.

use std::collections::HashSet;

use prgate_env::ExecutionTarget;
use prgate_ledger::RunEvent;
use serde::{Deserialize, Serialize};

use crate::config::Exclusion;
use crate::error::GateError;
use crate::phase::JobPhase;
use crate::stage::{StageAction, StageOutcome, StageStatus};

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

impl GateVerdict {
    fn from_violations(violations: Vec<String>) -> Self {
        let passed = violations.is_empty();
        let message = if passed {
            "All stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };
        Self {
            passed,
            violations,
            message,
        }
    }
}

/// Verdict of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVerdict {
    pub run_id: String,
    pub target: ExecutionTarget,
    pub plan_digest: String,
    pub stages: Vec<StageOutcome>,
    pub gate: GateVerdict,
    /// Tests deliberately not run on this target.
    pub exclusions: Vec<Exclusion>,
    /// Phases the job went through, ending in `Passed` or `Failed`.
    pub phases: Vec<JobPhase>,
    pub duration_ms: u64,
}

impl JobVerdict {
    pub fn passed(&self) -> bool {
        self.gate.passed
    }

    pub fn first_failure(&self) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.status == StageStatus::Failed)
    }

    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// A failed verdict for a job that could not be run or recorded. The
    /// job has no stages; the error is its only violation.
    pub fn aborted(target: ExecutionTarget, error: &GateError) -> Self {
        Self {
            run_id: String::new(),
            target,
            plan_digest: String::new(),
            stages: Vec::new(),
            gate: GateVerdict::from_violations(vec![format!(
                "Job {} could not run: {}",
                target, error
            )]),
            exclusions: Vec::new(),
            phases: vec![JobPhase::Failed],
            duration_ms: 0,
        }
    }

    pub fn skipped_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Skipped)
            .count()
    }
}

/// A category that passed on one target and failed on the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDrift {
    pub stage: String,
    pub passed_on: ExecutionTarget,
    pub failed_on: ExecutionTarget,
}

/// Final pull-request gate decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub passed: bool,
    pub jobs: Vec<JobVerdict>,
    /// Required targets with no verdict.
    pub missing: Vec<ExecutionTarget>,
    pub drift: Vec<EnvironmentDrift>,
}

impl GateDecision {
    pub fn job(&self, target: ExecutionTarget) -> Option<&JobVerdict> {
        self.jobs.iter().find(|j| j.target == target)
    }
}

/// Gate evaluation rules.
pub struct Gate;

impl Gate {
    /// Evaluate a job from its stage outcomes, in declaration order.
    pub fn evaluate_job(stages: &[StageOutcome]) -> GateVerdict {
        let mut violations = Vec::new();
        for stage in stages {
            match stage.status {
                StageStatus::Passed => {}
                StageStatus::Failed => {
                    let kind = stage
                        .failure
                        .map(|k| k.name())
                        .unwrap_or("unknown");
                    let detail = match (&stage.error, stage.exit_code) {
                        (Some(error), _) => error.clone(),
                        (None, Some(code)) => format!("exit code {code}"),
                        (None, None) => "no exit status".to_string(),
                    };
                    violations.push(format!("Stage '{}' failed ({}): {}", stage.name, kind, detail));
                }
                StageStatus::Skipped => {
                    violations.push(format!("Stage '{}' was skipped", stage.name));
                }
            }
        }
        GateVerdict::from_violations(violations)
    }

    /// Re-derive a job verdict from recorded ledger events.
    ///
    /// Every `stage_started` must be followed by a `stage_passed` for the same
    /// stage. Failed and skipped stages are violations, as is a stage that
    /// started and never finished.
    pub fn evaluate_events(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut started = Vec::new();
        let mut finished = HashSet::new();

        for event in events {
            let stage = event.payload["stage"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            match event.kind.as_str() {
                "stage_started" => {
                    if !started.contains(&stage) {
                        started.push(stage);
                    }
                }
                "stage_passed" => {
                    finished.insert(stage);
                }
                "stage_failed" => {
                    let error = event.payload["error"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            format!("exit code {}", event.payload["exit_code"].as_i64().unwrap_or(-1))
                        });
                    violations.push(format!("Stage '{}' failed: {}", stage, error));
                    finished.insert(stage);
                }
                "stage_skipped" => {
                    violations.push(format!("Stage '{}' was skipped", stage));
                }
                _ => {}
            }
        }

        for stage in &started {
            if !finished.contains(stage) {
                violations.push(format!("Stage '{}' was started but never completed", stage));
            }
        }

        GateVerdict::from_violations(violations)
    }

    /// Combine job verdicts. Passes iff every required target has a passing
    /// verdict.
    pub fn decide(jobs: Vec<JobVerdict>, required: &[ExecutionTarget]) -> GateDecision {
        let missing: Vec<ExecutionTarget> = required
            .iter()
            .copied()
            .filter(|t| !jobs.iter().any(|j| j.target == *t))
            .collect();
        let passed = missing.is_empty()
            && !jobs.is_empty()
            && jobs
                .iter()
                .filter(|j| required.contains(&j.target))
                .all(JobVerdict::passed);
        let drift = detect_drift(&jobs);
        GateDecision {
            passed,
            jobs,
            missing,
            drift,
        }
    }
}

fn detect_drift(jobs: &[JobVerdict]) -> Vec<EnvironmentDrift> {
    let mut drift = Vec::new();
    for (i, a) in jobs.iter().enumerate() {
        for b in &jobs[i + 1..] {
            for sa in a
                .stages
                .iter()
                .filter(|s| matches!(s.action, StageAction::RunCategory(_)))
            {
                let Some(sb) = b.stages.iter().find(|s| s.name == sa.name) else {
                    continue;
                };
                match (sa.status, sb.status) {
                    (StageStatus::Passed, StageStatus::Failed) => drift.push(EnvironmentDrift {
                        stage: sa.name.clone(),
                        passed_on: a.target,
                        failed_on: b.target,
                    }),
                    (StageStatus::Failed, StageStatus::Passed) => drift.push(EnvironmentDrift {
                        stage: sa.name.clone(),
                        passed_on: b.target,
                        failed_on: a.target,
                    }),
                    _ => {}
                }
            }
        }
    }
    drift
}
