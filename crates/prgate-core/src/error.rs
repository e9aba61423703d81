//! Error types for prgate-core

use prgate_env::{ExecError, ProvisionError};
use prgate_ledger::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::phase::JobPhase;

/// Errors raised while classifying the test corpus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// A test matched more than one non-general category
    #[error("Test {test} matches several categories: {}", categories.join(", "))]
    Overlap {
        test: String,
        categories: Vec<String>,
    },

    /// A test is outside every category, including the general one
    #[error("Test {test} is not covered by any category")]
    Uncovered { test: String },

    /// A test in an integration group that no integration category selects
    #[error("Test {test} is in integration group {group} but no integration category selects it")]
    UnclaimedIntegration { test: String, group: String },

    /// No general category to absorb the remainder
    #[error("No general category configured")]
    MissingGeneral,
}

#[derive(Error, Debug)]
pub enum GateError {
    /// Invalid pipeline configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed TOML
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Test discovery could not read the tree
    #[error("Failed to discover tests under {path}: {source}")]
    Discovery {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    /// Image build or container start failed
    #[error("Container image build or start failed with exit code {exit_code}: {stderr}")]
    Build { exit_code: i32, stderr: String },

    /// A category's isolation requirement does not hold
    #[error("Category {category} cannot run: {reason}")]
    Precondition { category: String, reason: String },

    /// Illegal job state transition
    #[error("Illegal job phase transition from {from} to {to}")]
    Phase { from: JobPhase, to: JobPhase },

    /// The outer job deadline elapsed
    #[error("Job deadline of {secs}s exceeded")]
    Deadline { secs: u64 },

    #[error("Ledger error: {0}")]
    Ledger(#[from] StorageError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl GateError {
    /// How a stage that raised this error is reported.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GateError::Provisioning(_) => FailureKind::Provisioning,
            GateError::Build { .. } => FailureKind::Build,
            GateError::Precondition { .. } => FailureKind::Precondition,
            GateError::Deadline { .. } => FailureKind::Deadline,
            GateError::Exec(_) => FailureKind::Exec,
            _ => FailureKind::Internal,
        }
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Environment provisioning step failed; terminal for the job
    Provisioning,
    /// Test tool reported failures
    TestFailure,
    /// Image build or container start failed; terminal for the container job
    Build,
    /// Source checkout, sync or cache clear exited non-zero
    Command,
    /// Isolation requirement not met
    Precondition,
    /// Command could not be launched
    Exec,
    /// Job deadline elapsed while the stage ran
    Deadline,
    /// Ledger or state machine failure
    Internal,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::Provisioning => "provisioning",
            FailureKind::TestFailure => "test_failure",
            FailureKind::Build => "build",
            FailureKind::Command => "command",
            FailureKind::Precondition => "precondition",
            FailureKind::Exec => "exec",
            FailureKind::Deadline => "deadline",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
