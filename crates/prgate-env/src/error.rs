//! Error types for prgate-env

use thiserror::Error;

/// Errors raised while launching an external command.
///
/// A command that runs and exits non-zero is not an error at this level; it is
/// reported through `CommandOutput::exit_code`.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Command has no program to execute
    #[error("Command is empty")]
    EmptyCommand,

    /// Program could not be spawned (missing binary, permissions)
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error while waiting on the child
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the environment provisioner. All of them are terminal for
/// the job that triggered provisioning.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A provisioning step exited non-zero
    #[error("Provisioning step {step} failed with exit code {exit_code}: {stderr}")]
    StepFailed {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    /// A background service did not answer its readiness check
    #[error("Service {service} is not ready")]
    ServiceNotReady { service: String },

    /// Command could not be launched
    #[error(transparent)]
    Exec(#[from] ExecError),
}
