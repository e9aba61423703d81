//! prgate-core: the pull-request test gate
//!
//! Provides the test-orchestration engine that:
//! - Partitions the test corpus into disjoint, ordered categories
//! - Runs each category at its worker count inside a provisioned environment
//! - Replays the same job inside a freshly built container
//! - Records every job in the run ledger and decides the gate

pub mod config;
mod error;
pub mod gate;
pub mod partition;
pub mod phase;
pub mod pipeline;
pub mod plan;
pub mod recording;
pub mod replay;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod trigger;

// Re-export key types
pub use config::{CategoryConfig, Exclusion, PipelineConfig, PolicyConfig, Workers};
pub use error::{FailureKind, GateError, PartitionError, Result};
pub use gate::{EnvironmentDrift, Gate, GateDecision, GateVerdict, JobVerdict};
pub use partition::{
    CategoryAssignment, CategoryKind, Isolation, Partition, Phase, SuitePartitioner, TestCorpus,
};
pub use phase::{JobPhase, PhaseTracker};
pub use pipeline::{GatePipeline, JobContext};
pub use plan::JobPlan;
pub use replay::ContainerReplay;
pub use runner::{CategoryRun, SuiteRunner, TestCounts};
pub use stage::{Stage, StageAction, StageOutcome, StageStatus};
pub use trigger::{PullRequestEvent, TriggerFilter};
