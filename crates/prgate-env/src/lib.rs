//! prgate-env: execution environments for gate jobs
//!
//! This crate owns everything that touches the machine a job runs on:
//!
//! - `exec`: the `CommandExecutor` seam (local processes, `docker exec`)
//! - `environment`: the per-job `Environment` handle (packages, runtime pin,
//!   background services)
//! - `provision`: the `EnvironmentProvisioner` that establishes it
//!
//! Provisioning is fail-fast and never retries; a failed step ends the job.

pub mod environment;
mod error;
pub mod exec;
pub mod fakes;
pub mod provision;

pub use environment::{Environment, ExecutionTarget, ServiceHandle};
pub use error::{ExecError, ProvisionError};
pub use exec::{
    CommandExecutor, CommandOutput, CommandSpec, ContainerExecutor, Invocation, ProcessExecutor,
};
pub use provision::{
    CacheServerSpec, EnvironmentProvisioner, PlatformDescriptor, ProvisionStep, RuntimeSpec,
    StepKind, StepReport, TrafficEngineSpec,
};

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
