//! Pipeline configuration.
//!
//! The whole pipeline is described by one TOML document. Every section has a
//! default matching the canonical gate, so an empty file (or no file) yields
//! a runnable configuration.

use std::collections::HashSet;
use std::path::Path;

use prgate_env::{CommandSpec, ExecutionTarget, PlatformDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::GateError;
use crate::partition::{CategoryKind, Isolation, Phase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub product: ProductConfig,
    pub trigger: TriggerConfig,
    pub platform: PlatformDescriptor,
    pub test_tool: TestToolConfig,
    /// Execution order. Unit-phase categories must precede integration ones.
    #[serde(rename = "category")]
    pub categories: Vec<CategoryConfig>,
    pub container: ContainerConfig,
    pub source: SourceConfig,
    pub policy: PolicyConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            product: ProductConfig::default(),
            trigger: TriggerConfig::default(),
            platform: PlatformDescriptor::ubuntu(),
            test_tool: TestToolConfig::default(),
            categories: CategoryConfig::canonical(),
            container: ContainerConfig::default(),
            source: SourceConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, GateError> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn category(&self, kind: CategoryKind) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.kind == kind)
    }

    /// Platform used inside the container job.
    pub fn container_platform(&self) -> PlatformDescriptor {
        self.container
            .platform
            .clone()
            .unwrap_or_else(|| self.platform.clone().without_sudo())
    }

    /// Reject configurations that would break ordering or isolation rules.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.categories.is_empty() {
            return Err(GateError::Config("no test categories configured".into()));
        }

        if self.categories[0].kind != CategoryKind::General {
            return Err(GateError::Config(format!(
                "general category must run first, found {}",
                self.categories[0].kind.label()
            )));
        }

        let mut kinds = HashSet::new();
        let mut seen_integration = false;
        for cat in &self.categories {
            if !kinds.insert(cat.kind) {
                return Err(GateError::Config(format!(
                    "category {} configured twice",
                    cat.kind.label()
                )));
            }
            match cat.kind.phase() {
                Phase::Integration => seen_integration = true,
                Phase::Unit if seen_integration => {
                    return Err(GateError::Config(format!(
                        "unit category {} listed after an integration category",
                        cat.kind.label()
                    )));
                }
                Phase::Unit => {}
            }
            for target in ExecutionTarget::ALL {
                let workers = cat.workers.for_target(target);
                if workers == 0 {
                    return Err(GateError::Config(format!(
                        "category {} has zero workers on {}",
                        cat.kind.label(),
                        target
                    )));
                }
                if cat.isolation.requires_serial() && workers != 1 {
                    return Err(GateError::Config(format!(
                        "category {} requires serial execution but has {} workers on {}",
                        cat.kind.label(),
                        workers,
                        target
                    )));
                }
            }
            if cat.kind != CategoryKind::General && cat.paths.is_empty() {
                return Err(GateError::Config(format!(
                    "category {} selects no paths",
                    cat.kind.label()
                )));
            }
        }
        if self.product.cache_clear.is_empty() {
            return Err(GateError::Config("product cache-clear command is empty".into()));
        }
        if self.test_tool.program.is_empty() {
            return Err(GateError::Config("test tool program is empty".into()));
        }
        if self.policy.job_timeout_secs == 0 {
            return Err(GateError::Config("job_timeout_secs must be positive".into()));
        }
        for exclusion in &self.container.exclusions {
            if self.category(exclusion.category).is_none() {
                return Err(GateError::Config(format!(
                    "exclusion {} names unconfigured category {}",
                    exclusion.test,
                    exclusion.category.label()
                )));
            }
        }
        Ok(())
    }
}

/// The product under test, seen only through its CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductConfig {
    pub name: String,
    /// Flushes the product's cache between unit and integration phases.
    pub cache_clear: CommandSpec,
    /// Environment variable carrying the version pin (tagging only).
    pub version_env: String,
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            name: "slips".to_string(),
            cache_clear: CommandSpec::argv(["./slips.py", "-cc"]),
            version_env: "SLIPS_VERSION".to_string(),
        }
    }
}

/// Pull-request base branch filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            include: vec!["master".to_string()],
            exclude: vec!["develop".to_string()],
        }
    }
}

/// How the test-execution tool is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestToolConfig {
    pub program: Vec<String>,
    /// Flag followed by the worker count.
    pub workers_flag: String,
    /// Flag prefix for excluded paths, joined as `<flag>=<path>`.
    pub ignore_flag: String,
    /// Flag followed by a single test id to drop.
    pub deselect_flag: String,
    /// Warning suppression.
    pub quiet_warnings: Vec<String>,
    /// Verbose, unbuffered output capture.
    pub verbosity: Vec<String>,
}

impl Default for TestToolConfig {
    fn default() -> Self {
        Self {
            program: vec!["python3".into(), "-m".into(), "pytest".into()],
            workers_flag: "-n".to_string(),
            ignore_flag: "--ignore".to_string(),
            deselect_flag: "--deselect".to_string(),
            quiet_warnings: vec!["-p".into(), "no:warnings".into()],
            verbosity: vec!["-vv".into(), "-s".into()],
        }
    }
}

/// Worker counts per execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workers {
    pub bare_metal: u32,
    pub container: u32,
}

impl Workers {
    pub fn same(n: u32) -> Self {
        Self {
            bare_metal: n,
            container: n,
        }
    }

    pub fn for_target(&self, target: ExecutionTarget) -> u32 {
        match target {
            ExecutionTarget::BareMetal => self.bare_metal,
            ExecutionTarget::Container => self.container,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub kind: CategoryKind,
    /// Test paths selected by this category. The general category selects
    /// the test root; its exclusions are derived from the other categories.
    pub paths: Vec<String>,
    pub workers: Workers,
    pub isolation: Isolation,
}

impl CategoryConfig {
    /// The canonical five-way battery, in execution order.
    pub fn canonical() -> Vec<Self> {
        vec![
            CategoryConfig {
                kind: CategoryKind::General,
                paths: vec!["tests/".to_string()],
                workers: Workers::same(7),
                isolation: Isolation::None,
            },
            CategoryConfig {
                kind: CategoryKind::Storage,
                paths: vec!["tests/test_database.py".to_string()],
                workers: Workers::same(1),
                isolation: Isolation::CacheServer,
            },
            CategoryConfig {
                kind: CategoryKind::Daemon,
                paths: vec!["tests/test_daemon.py".to_string()],
                workers: Workers::same(1),
                isolation: Isolation::ExclusiveProcess,
            },
            CategoryConfig {
                kind: CategoryKind::DatasetIntegration,
                paths: vec!["tests/integration_tests/test_dataset.py".to_string()],
                workers: Workers {
                    bare_metal: 3,
                    container: 4,
                },
                isolation: Isolation::CacheServer,
            },
            CategoryConfig {
                kind: CategoryKind::ConfigIntegration,
                paths: vec!["tests/integration_tests/test_config_files.py".to_string()],
                workers: Workers::same(2),
                isolation: Isolation::CacheServer,
            },
        ]
    }
}

/// A test deliberately not run inside the container, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub category: CategoryKind,
    /// Test id as understood by the test tool's deselect flag.
    pub test: String,
    pub reason: String,
}

/// Image build and container run settings for the replay job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub runtime: String,
    /// Build context, relative to the workspace.
    pub context: String,
    pub dockerfile: String,
    /// Image repository; the tag is derived per job.
    pub image: String,
    /// Source checkout location inside the image.
    pub workdir: String,
    /// Extra `run` flags.
    pub run_args: Vec<String>,
    /// Keeps the detached container alive between stages.
    pub keepalive: Vec<String>,
    pub exclusions: Vec<Exclusion>,
    /// Platform override; defaults to the host platform without sudo.
    pub platform: Option<PlatformDescriptor>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            context: "./".to_string(),
            dockerfile: "docker/ubuntu-image/Dockerfile".to_string(),
            image: "prgate/product-under-test".to_string(),
            workdir: "/StratosphereLinuxIPS".to_string(),
            run_args: Vec::new(),
            keepalive: vec!["sleep".to_string(), "infinity".to_string()],
            exclusions: vec![Exclusion {
                category: CategoryKind::Daemon,
                test: "tests/test_daemon.py::test_blocking".to_string(),
                reason: "network blocking needs NET_ADMIN, which the container lacks".to_string(),
            }],
            platform: None,
        }
    }
}

/// Source checkout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub remote: String,
    /// Check out the reviewed ref on bare metal too. Off by default so a
    /// local run never rewrites the caller's working tree.
    pub checkout_bare_metal: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            checkout_bare_metal: false,
        }
    }
}

/// Failure policy. The defaults are the gate's contract: no retries,
/// fail-fast, and a large but finite job deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_retries: u32,
    pub fail_fast: bool,
    pub job_timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            fail_fast: true,
            job_timeout_secs: 1800 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().expect("default must validate");
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn policy_defaults_are_no_retry_fail_fast() {
        let policy = PolicyConfig::default();
        assert_eq!(policy.max_retries, 0);
        assert!(policy.fail_fast);
        assert!(policy.job_timeout_secs > 3600);
    }

    #[test]
    fn partial_toml_overrides_one_section() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [policy]
            job_timeout_secs = 600

            [trigger]
            include = ["main"]
            "#,
        )
        .unwrap();
        assert_eq!(config.policy.job_timeout_secs, 600);
        assert!(config.policy.fail_fast);
        assert_eq!(config.trigger.include, vec!["main"]);
        assert_eq!(config.trigger.exclude, vec!["develop"]);
    }

    #[test]
    fn categories_parse_from_array_of_tables() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[category]]
            kind = "general"
            paths = ["tests/"]
            workers = { bare_metal = 4, container = 4 }
            isolation = "none"

            [[category]]
            kind = "storage"
            paths = ["tests/test_database.py"]
            workers = { bare_metal = 1, container = 1 }
            isolation = "cache_server"
            "#,
        )
        .unwrap();
        assert_eq!(config.categories.len(), 2);
        assert_eq!(config.categories[1].isolation, Isolation::CacheServer);
    }

    #[test]
    fn serial_isolation_rejects_parallel_workers() {
        let mut config = PipelineConfig::default();
        config.categories[2].workers = Workers::same(3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("serial"));
    }

    #[test]
    fn unit_after_integration_is_rejected() {
        let mut config = PipelineConfig::default();
        config.categories.swap(2, 3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn general_must_come_first() {
        let mut config = PipelineConfig::default();
        config.categories.swap(0, 1);
        assert!(config.validate().unwrap_err().to_string().contains("must run first"));

        let mut config = PipelineConfig::default();
        config.categories.remove(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_category_is_rejected() {
        let mut config = PipelineConfig::default();
        let dup = config.categories[1].clone();
        config.categories.insert(2, dup);
        assert!(config.validate().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = PipelineConfig::default();
        config.categories[0].workers.container = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn container_platform_drops_sudo() {
        let config = PipelineConfig::default();
        let platform = config.container_platform();
        assert_ne!(platform.install_prefix.first().map(String::as_str), Some("sudo"));
    }
}
