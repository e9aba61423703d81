//! Environment provisioning.
//!
//! Turns a [`PlatformDescriptor`] into an ordered list of provisioning steps
//! and applies them to an [`Environment`]. Any failing step is terminal; no
//! step is retried here.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::environment::Environment;
use crate::error::ProvisionError;
use crate::exec::{CommandOutput, CommandSpec};

/// Network traffic analysis engine installed next to the product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEngineSpec {
    pub name: String,
    /// Repository setup and install commands, run in order.
    pub install: Vec<CommandSpec>,
}

/// Language runtime and the product's own dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub name: String,
    /// Version pin, e.g. "3.8".
    pub version: String,
    pub install: Vec<CommandSpec>,
    /// Dependency installation (e.g. pip install -r install/requirements.txt).
    pub dependencies: Vec<CommandSpec>,
}

/// Key-value cache server started in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheServerSpec {
    pub name: String,
    /// Must daemonize and return.
    pub start: CommandSpec,
    /// Exits zero once the server answers.
    pub ready_check: CommandSpec,
}

/// Target platform: package manager and the fixed package set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    pub name: String,
    /// Index refresh run before installing (e.g. apt-get update).
    #[serde(default)]
    pub refresh: Option<CommandSpec>,
    /// Install prefix; package names are appended.
    pub install_prefix: Vec<String>,
    pub system_packages: Vec<String>,
    pub traffic_engine: TrafficEngineSpec,
    pub runtime: RuntimeSpec,
    pub cache_server: CacheServerSpec,
}

impl PlatformDescriptor {
    /// Ubuntu runner with apt, zeek, python and redis.
    pub fn ubuntu() -> Self {
        Self {
            name: "ubuntu-20.04".to_string(),
            refresh: Some(CommandSpec::argv(["sudo", "apt-get", "update", "--fix-missing"])),
            install_prefix: vec![
                "sudo".to_string(),
                "apt-get".to_string(),
                "-y".to_string(),
                "--no-install-recommends".to_string(),
                "install".to_string(),
            ],
            system_packages: [
                "git",
                "wget",
                "curl",
                "ca-certificates",
                "gnupg",
                "python3-pip",
                "python3-certifi",
                "python3-dev",
                "build-essential",
                "file",
                "lsof",
                "net-tools",
                "iproute2",
                "iptables",
                "libpcap-dev",
                "libmagic-dev",
                "whois",
                "tshark",
                "redis-server",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            traffic_engine: TrafficEngineSpec {
                name: "zeek".to_string(),
                install: vec![
                    CommandSpec::shell(
                        "echo 'deb http://download.opensuse.org/repositories/security:/zeek/xUbuntu_20.04/ /' \
                         | sudo tee /etc/apt/sources.list.d/security:zeek.list",
                    ),
                    CommandSpec::shell(
                        "curl -fsSL https://download.opensuse.org/repositories/security:zeek/xUbuntu_20.04/Release.key \
                         | gpg --dearmor | sudo tee /etc/apt/trusted.gpg.d/security_zeek.gpg > /dev/null",
                    ),
                    CommandSpec::argv(["sudo", "apt-get", "update"]),
                    CommandSpec::argv(["sudo", "apt-get", "-y", "install", "zeek"]),
                    CommandSpec::argv(["sudo", "ln", "-sf", "/opt/zeek/bin/zeek", "/usr/local/bin/bro"]),
                ],
            },
            runtime: RuntimeSpec {
                name: "python".to_string(),
                version: "3.8".to_string(),
                install: vec![CommandSpec::argv([
                    "sudo",
                    "apt-get",
                    "-y",
                    "install",
                    "python3.8",
                ])],
                dependencies: vec![
                    CommandSpec::argv(["python3", "-m", "pip", "install", "--upgrade", "pip"]),
                    CommandSpec::argv([
                        "python3",
                        "-m",
                        "pip",
                        "install",
                        "-r",
                        "install/requirements.txt",
                    ]),
                    CommandSpec::argv(["python3", "-m", "pip", "install", "pytest-xdist"]),
                ],
            },
            cache_server: CacheServerSpec {
                name: "redis".to_string(),
                start: CommandSpec::argv(["redis-server", "--daemonize", "yes"]),
                ready_check: CommandSpec::argv(["redis-cli", "ping"]),
            },
        }
    }

    /// Same platform with `sudo` dropped, for images that already run as root.
    pub fn without_sudo(mut self) -> Self {
        fn strip(cmd: &CommandSpec) -> CommandSpec {
            match cmd {
                CommandSpec::Argv(parts) if parts.first().map(String::as_str) == Some("sudo") => {
                    CommandSpec::Argv(parts[1..].to_vec())
                }
                CommandSpec::Argv(parts) => CommandSpec::Argv(parts.clone()),
                CommandSpec::Shell(script) => CommandSpec::Shell(
                    script
                        .replace("| sudo ", "| ")
                        .trim_start_matches("sudo ")
                        .to_string(),
                ),
            }
        }
        let strip_all = |cmds: &[CommandSpec]| cmds.iter().map(strip).collect::<Vec<_>>();

        self.refresh = self.refresh.as_ref().map(strip);
        if self.install_prefix.first().map(String::as_str) == Some("sudo") {
            self.install_prefix.remove(0);
        }
        self.traffic_engine.install = strip_all(&self.traffic_engine.install);
        self.runtime.install = strip_all(&self.runtime.install);
        self.runtime.dependencies = strip_all(&self.runtime.dependencies);
        self
    }

    /// The package install command for the fixed package set.
    pub fn install_command(&self) -> CommandSpec {
        let mut argv = self.install_prefix.clone();
        argv.extend(self.system_packages.iter().cloned());
        CommandSpec::Argv(argv)
    }
}

/// Kind of provisioning step, in required order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SystemPackages,
    TrafficEngine,
    Runtime,
    Dependencies,
    StartCacheServer,
    VerifyCacheServer,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::SystemPackages => "install_system_packages",
            StepKind::TrafficEngine => "install_traffic_engine",
            StepKind::Runtime => "install_runtime",
            StepKind::Dependencies => "install_dependencies",
            StepKind::StartCacheServer => "start_cache_server",
            StepKind::VerifyCacheServer => "verify_cache_server",
        }
    }
}

/// One provisioning step: a kind plus the commands it runs in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionStep {
    pub kind: StepKind,
    pub commands: Vec<CommandSpec>,
}

impl ProvisionStep {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Outcome of applying a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub kind: StepKind,
    /// Combined output of every command in the step.
    pub output: CommandOutput,
    /// True when the step had nothing to do (already applied in this job).
    pub skipped: bool,
}

pub struct EnvironmentProvisioner {
    platform: PlatformDescriptor,
}

impl EnvironmentProvisioner {
    pub fn new(platform: PlatformDescriptor) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &PlatformDescriptor {
        &self.platform
    }

    /// Ordered provisioning steps for the platform.
    pub fn plan(&self) -> Vec<ProvisionStep> {
        let p = &self.platform;
        let mut packages = Vec::new();
        if let Some(refresh) = &p.refresh {
            packages.push(refresh.clone());
        }
        packages.push(p.install_command());

        vec![
            ProvisionStep {
                kind: StepKind::SystemPackages,
                commands: packages,
            },
            ProvisionStep {
                kind: StepKind::TrafficEngine,
                commands: p.traffic_engine.install.clone(),
            },
            ProvisionStep {
                kind: StepKind::Runtime,
                commands: p.runtime.install.clone(),
            },
            ProvisionStep {
                kind: StepKind::Dependencies,
                commands: p.runtime.dependencies.clone(),
            },
            ProvisionStep {
                kind: StepKind::StartCacheServer,
                commands: vec![p.cache_server.start.clone()],
            },
            ProvisionStep {
                kind: StepKind::VerifyCacheServer,
                commands: vec![p.cache_server.ready_check.clone()],
            },
        ]
    }

    /// Apply one step. Commands run in order; the first non-zero exit ends
    /// the step with `StepFailed`.
    pub async fn apply_step(
        &self,
        env: &mut Environment,
        step: &ProvisionStep,
    ) -> Result<StepReport, ProvisionError> {
        let cache = &self.platform.cache_server.name;

        if env.is_provisioned() {
            debug!(step = step.name(), "environment already provisioned");
            return Ok(StepReport {
                kind: step.kind,
                output: CommandOutput::default(),
                skipped: true,
            });
        }

        // The cache server is a per-job singleton and is never restarted.
        if step.kind == StepKind::StartCacheServer && env.service_started(cache) {
            debug!(service = %cache, "cache server already started, not restarting");
            return Ok(StepReport {
                kind: step.kind,
                output: CommandOutput::default(),
                skipped: true,
            });
        }

        let mut combined = CommandOutput::default();
        for command in &step.commands {
            debug!(step = step.name(), command = %command, "provisioning");
            let output = env.run(command).await?;
            combined.stdout.push_str(&output.stdout);
            combined.stderr.push_str(&output.stderr);
            combined.duration_ms += output.duration_ms;
            combined.exit_code = output.exit_code;

            if !output.success() {
                if step.kind == StepKind::VerifyCacheServer {
                    return Err(ProvisionError::ServiceNotReady {
                        service: cache.clone(),
                    });
                }
                return Err(ProvisionError::StepFailed {
                    step: step.name().to_string(),
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                });
            }
        }

        match step.kind {
            StepKind::SystemPackages => {
                env.record_packages(self.platform.system_packages.iter().cloned())
            }
            StepKind::TrafficEngine => {
                env.record_packages(std::iter::once(self.platform.traffic_engine.name.clone()))
            }
            StepKind::Runtime => env.record_runtime(format!(
                "{}-{}",
                self.platform.runtime.name, self.platform.runtime.version
            )),
            StepKind::Dependencies => {}
            StepKind::StartCacheServer => env.record_service_started(cache),
            StepKind::VerifyCacheServer => env.record_service_ready(cache),
        }

        Ok(StepReport {
            kind: step.kind,
            output: combined,
            skipped: false,
        })
    }

    /// Mark the environment read-only from here on.
    pub fn finish(&self, env: &mut Environment) {
        env.mark_provisioned();
        let digest = env.digest();
        info!(
            target_kind = %env.target(),
            digest = %&digest[..12],
            "environment provisioned"
        );
    }

    /// Apply every step. A second call on an already provisioned environment
    /// is a no-op and returns an empty report list.
    pub async fn provision(&self, env: &mut Environment) -> Result<Vec<StepReport>, ProvisionError> {
        if env.is_provisioned() {
            warn!(target_kind = %env.target(), "environment already provisioned, skipping");
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        for step in self.plan() {
            reports.push(self.apply_step(env, &step).await?);
        }
        self.finish(env);
        Ok(reports)
    }
}
