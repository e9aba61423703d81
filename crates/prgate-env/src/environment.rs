//! The per-job Environment handle.
//!
//! Holds what provisioning established (package set, runtime pin, running
//! services) together with the executor every stage uses. Only the
//! provisioner mutates it; stages receive `&Environment`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ExecError;
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec, Invocation};

/// Where a job's stages execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionTarget {
    BareMetal,
    Container,
}

impl ExecutionTarget {
    pub const ALL: [Self; 2] = [Self::BareMetal, Self::Container];

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionTarget::BareMetal => "bare-metal",
            ExecutionTarget::Container => "container",
        }
    }
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bare-metal" | "baremetal" | "vm" => Ok(ExecutionTarget::BareMetal),
            "container" | "docker" => Ok(ExecutionTarget::Container),
            other => Err(format!("unknown execution target: {other}")),
        }
    }
}

/// A background service started during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub name: String,
    pub ready: bool,
}

pub struct Environment {
    target: ExecutionTarget,
    workdir: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    env_vars: BTreeMap<String, String>,
    packages: BTreeSet<String>,
    runtime_pin: Option<String>,
    services: Vec<ServiceHandle>,
    provisioned: bool,
}

impl Environment {
    pub fn new(
        target: ExecutionTarget,
        workdir: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            target,
            workdir: workdir.into(),
            executor,
            env_vars: BTreeMap::new(),
            packages: BTreeSet::new(),
            runtime_pin: None,
            services: Vec::new(),
            provisioned: false,
        }
    }

    /// Variables passed to every command (e.g. the product version pin).
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn target(&self) -> ExecutionTarget {
        self.target
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    pub fn packages(&self) -> &BTreeSet<String> {
        &self.packages
    }

    pub fn runtime_pin(&self) -> Option<&str> {
        self.runtime_pin.as_deref()
    }

    pub fn services(&self) -> &[ServiceHandle] {
        &self.services
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    pub fn service_ready(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name && s.ready)
    }

    pub fn service_started(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name)
    }

    /// Run a command in this environment's working directory.
    pub async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        if command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let invocation = Invocation::new(command)
            .in_dir(&self.workdir)
            .with_env(self.env_vars.clone());
        self.executor.execute(&invocation).await
    }

    /// Deterministic digest of the provisioned state.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.target.name().as_bytes());
        hasher.update(b"\0");
        for pkg in &self.packages {
            hasher.update(pkg.as_bytes());
            hasher.update(b"\0");
        }
        if let Some(pin) = &self.runtime_pin {
            hasher.update(pin.as_bytes());
        }
        hasher.update(b"\0");
        for service in &self.services {
            hasher.update(service.name.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    pub(crate) fn record_packages<I: IntoIterator<Item = String>>(&mut self, packages: I) {
        self.packages.extend(packages);
    }

    pub(crate) fn record_runtime(&mut self, pin: String) {
        self.runtime_pin = Some(pin);
    }

    pub(crate) fn record_service_started(&mut self, name: &str) {
        if !self.service_started(name) {
            self.services.push(ServiceHandle {
                name: name.to_string(),
                ready: false,
            });
        }
    }

    pub(crate) fn record_service_ready(&mut self, name: &str) {
        if let Some(service) = self.services.iter_mut().find(|s| s.name == name) {
            service.ready = true;
        }
    }

    pub(crate) fn mark_provisioned(&mut self) {
        self.provisioned = true;
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("target", &self.target)
            .field("workdir", &self.workdir)
            .field("packages", &self.packages)
            .field("runtime_pin", &self.runtime_pin)
            .field("services", &self.services)
            .field("provisioned", &self.provisioned)
            .finish()
    }
}
