//! Per-job state machine.
//!
//! `Provisioning → RunningCategory[1..k] → CacheFlush → RunningIntegration[1..m]
//! → Evaluated → Passed | Failed`. A job may stay in its current phase across
//! several stages but never moves back, and integration phases are only
//! reachable after the cache flush.

use serde::{Deserialize, Serialize};

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Provisioning,
    /// Zero-based index among the unit categories.
    RunningCategory(usize),
    CacheFlush,
    /// Zero-based index among the integration categories.
    RunningIntegration(usize),
    Evaluated,
    Passed,
    Failed,
}

impl JobPhase {
    fn rank(&self) -> (u8, usize) {
        match self {
            JobPhase::Provisioning => (0, 0),
            JobPhase::RunningCategory(i) => (1, *i),
            JobPhase::CacheFlush => (2, 0),
            JobPhase::RunningIntegration(i) => (3, *i),
            JobPhase::Evaluated => (4, 0),
            JobPhase::Passed | JobPhase::Failed => (5, 0),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Passed | JobPhase::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Provisioning => write!(f, "provisioning"),
            JobPhase::RunningCategory(i) => write!(f, "running_category[{}]", i + 1),
            JobPhase::CacheFlush => write!(f, "cache_flush"),
            JobPhase::RunningIntegration(i) => write!(f, "running_integration[{}]", i + 1),
            JobPhase::Evaluated => write!(f, "evaluated"),
            JobPhase::Passed => write!(f, "passed"),
            JobPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Tracks the phases a job has gone through and rejects illegal moves.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    history: Vec<JobPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            history: vec![JobPhase::Provisioning],
        }
    }

    pub fn current(&self) -> JobPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(JobPhase::Provisioning)
    }

    pub fn history(&self) -> &[JobPhase] {
        &self.history
    }

    pub fn advance(&mut self, to: JobPhase) -> Result<(), GateError> {
        let from = self.current();
        if from == to && !from.is_terminal() {
            return Ok(());
        }

        let legal = if from.is_terminal() {
            false
        } else {
            match to {
                JobPhase::Passed | JobPhase::Failed => from == JobPhase::Evaluated,
                // Fail-fast may evaluate from any running phase.
                JobPhase::Evaluated => true,
                JobPhase::RunningIntegration(_) => {
                    self.history.contains(&JobPhase::CacheFlush) && to.rank() > from.rank()
                }
                _ => to.rank() > from.rank(),
            }
        };

        if !legal {
            return Err(GateError::Phase { from, to });
        }
        self.history.push(to);
        Ok(())
    }

    /// Move through `Evaluated` to the terminal phase matching `passed`.
    pub fn conclude(&mut self, passed: bool) -> Result<JobPhase, GateError> {
        self.advance(JobPhase::Evaluated)?;
        let terminal = if passed {
            JobPhase::Passed
        } else {
            JobPhase::Failed
        };
        self.advance(terminal)?;
        Ok(terminal)
    }
}
