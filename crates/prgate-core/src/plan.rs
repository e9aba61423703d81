//! Job plans and their identity.
//!
//! A plan is the fully resolved, ordered stage list of one job. The same
//! plan drives both targets; only the container target prepends image build,
//! container start and source sync. The plan digest covers everything that
//! determines what runs, so identical inputs always yield identical digests.

use prgate_env::{CommandSpec, EnvironmentProvisioner, ExecutionTarget};
use prgate_ledger::ContentDigest;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::partition::{Partition, Phase};
use crate::phase::JobPhase;
use crate::pipeline::JobContext;
use crate::replay::ContainerReplay;
use crate::runner::SuiteRunner;
use crate::stage::{Stage, StageAction};

pub const CLEAR_CACHE_STAGE: &str = "clear_cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlan {
    pub target: ExecutionTarget,
    pub stages: Vec<Stage>,
    pub digest: ContentDigest,
}

impl JobPlan {
    /// Resolve the stage list for one target. `replay` must be given for
    /// the container target.
    pub fn build(
        config: &PipelineConfig,
        partition: &Partition,
        ctx: &JobContext,
        replay: Option<&ContainerReplay>,
    ) -> Self {
        let target = partition.target;
        let mut stages = Vec::new();

        match (target, replay) {
            (ExecutionTarget::Container, Some(replay)) => {
                stages.push(Stage {
                    name: "build_image".to_string(),
                    phase: JobPhase::Provisioning,
                    action: StageAction::BuildImage,
                    commands: vec![replay.build_command()],
                    workers: None,
                    test_count: None,
                });
                stages.push(Stage {
                    name: "start_container".to_string(),
                    phase: JobPhase::Provisioning,
                    action: StageAction::StartContainer,
                    commands: vec![replay.start_command()],
                    workers: None,
                    test_count: None,
                });
                stages.push(Stage {
                    name: "sync_source".to_string(),
                    phase: JobPhase::Provisioning,
                    action: StageAction::SyncSource,
                    commands: replay.sync_commands(ctx),
                    workers: None,
                    test_count: None,
                });
            }
            _ if config.source.checkout_bare_metal => {
                let remote = config.source.remote.as_str();
                stages.push(Stage {
                    name: "checkout".to_string(),
                    phase: JobPhase::Provisioning,
                    action: StageAction::Checkout,
                    commands: vec![
                        CommandSpec::argv(["git", "fetch", remote]),
                        CommandSpec::argv(["git", "checkout", ctx.checkout_target(remote).as_str()]),
                    ],
                    workers: None,
                    test_count: None,
                });
            }
            _ => {}
        }

        let platform = match target {
            ExecutionTarget::BareMetal => config.platform.clone(),
            ExecutionTarget::Container => config.container_platform(),
        };
        for step in EnvironmentProvisioner::new(platform).plan() {
            stages.push(Stage {
                name: step.name().to_string(),
                phase: JobPhase::Provisioning,
                action: StageAction::Provision(step.kind),
                commands: step.commands,
                workers: None,
                test_count: None,
            });
        }

        let runner = SuiteRunner::new(config.test_tool.clone(), "");
        let mut unit_idx = 0;
        let mut integration_idx = 0;
        let mut flushed = false;
        for assignment in &partition.assignments {
            let phase = match assignment.kind.phase() {
                Phase::Unit => {
                    unit_idx += 1;
                    JobPhase::RunningCategory(unit_idx - 1)
                }
                Phase::Integration => {
                    if !flushed {
                        stages.push(Stage {
                            name: CLEAR_CACHE_STAGE.to_string(),
                            phase: JobPhase::CacheFlush,
                            action: StageAction::ClearCache,
                            commands: vec![config.product.cache_clear.clone()],
                            workers: None,
                            test_count: None,
                        });
                        flushed = true;
                    }
                    integration_idx += 1;
                    JobPhase::RunningIntegration(integration_idx - 1)
                }
            };
            stages.push(Stage {
                name: format!("test_{}", assignment.label()),
                phase,
                action: StageAction::RunCategory(assignment.kind),
                commands: vec![runner.command(assignment)],
                workers: Some(assignment.workers),
                test_count: Some(assignment.test_count()),
            });
        }

        let digest = compute_plan_digest(target, &stages);
        Self {
            target,
            stages,
            digest,
        }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// SHA-256 over target, stage names, argv and worker/test counts, in order.
fn compute_plan_digest(target: ExecutionTarget, stages: &[Stage]) -> ContentDigest {
    let mut buf = Vec::new();
    buf.extend_from_slice(target.name().as_bytes());
    buf.push(0);
    for stage in stages {
        buf.extend_from_slice(stage.name.as_bytes());
        buf.push(0);
        for command in &stage.commands {
            for arg in command.to_argv() {
                buf.extend_from_slice(arg.as_bytes());
                buf.push(0x1f);
            }
            buf.push(0x1e);
        }
        buf.extend_from_slice(&stage.workers.unwrap_or(0).to_le_bytes());
        buf.extend_from_slice(&(stage.test_count.unwrap_or(0) as u64).to_le_bytes());
        buf.push(0);
    }
    ContentDigest::from_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{SuitePartitioner, TestCorpus};

    fn ctx() -> JobContext {
        JobContext::new("master", "feature/x", Some("abcdef0123456789".into()), None)
    }

    fn corpus() -> TestCorpus {
        TestCorpus::new([
            "tests/test_a.py",
            "tests/test_database.py",
            "tests/test_daemon.py",
            "tests/integration_tests/test_dataset.py",
            "tests/integration_tests/test_config_files.py",
        ])
    }

    fn plan(config: &PipelineConfig, target: ExecutionTarget) -> JobPlan {
        let partition = SuitePartitioner::new(config)
            .partition(target, &corpus())
            .unwrap();
        let replay = ContainerReplay::new(config, &ctx());
        let replay = (target == ExecutionTarget::Container).then_some(&replay);
        JobPlan::build(config, &partition, &ctx(), replay)
    }

    #[test]
    fn bare_metal_stage_order() {
        let p = plan(&PipelineConfig::default(), ExecutionTarget::BareMetal);
        assert_eq!(
            p.stage_names(),
            vec![
                "install_system_packages",
                "install_traffic_engine",
                "install_runtime",
                "install_dependencies",
                "start_cache_server",
                "verify_cache_server",
                "test_general",
                "test_storage",
                "test_daemon",
                "clear_cache",
                "test_dataset_integration",
                "test_config_integration",
            ]
        );
    }

    #[test]
    fn container_prepends_build_start_and_sync() {
        let p = plan(&PipelineConfig::default(), ExecutionTarget::Container);
        assert_eq!(
            &p.stage_names()[..4],
            &["build_image", "start_container", "sync_source", "install_system_packages"]
        );
        assert_eq!(p.stage("test_dataset_integration").unwrap().workers, Some(4));
    }

    #[test]
    fn bare_metal_checkout_when_enabled() {
        let mut config = PipelineConfig::default();
        config.source.checkout_bare_metal = true;
        let p = plan(&config, ExecutionTarget::BareMetal);
        assert_eq!(p.stage_names()[0], "checkout");
        assert_eq!(
            p.stages[0].commands[1].to_string(),
            "git checkout abcdef0123456789"
        );
    }

    #[test]
    fn cache_clear_precedes_integration() {
        let p = plan(&PipelineConfig::default(), ExecutionTarget::BareMetal);
        let names = p.stage_names();
        let clear = names.iter().position(|n| *n == CLEAR_CACHE_STAGE).unwrap();
        let first_integration = p
            .stages
            .iter()
            .position(|s| matches!(s.phase, JobPhase::RunningIntegration(_)))
            .unwrap();
        assert_eq!(clear + 1, first_integration);
        assert_eq!(p.stages[clear].commands[0].to_string(), "./slips.py -cc");
    }

    #[test]
    fn digest_is_deterministic() {
        let config = PipelineConfig::default();
        let a = plan(&config, ExecutionTarget::BareMetal);
        let b = plan(&config, ExecutionTarget::BareMetal);
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, plan(&config, ExecutionTarget::Container).digest);
    }

    #[test]
    fn digest_tracks_worker_counts() {
        let config = PipelineConfig::default();
        let mut changed = config.clone();
        changed.categories[0].workers.bare_metal = 8;
        assert_ne!(
            plan(&config, ExecutionTarget::BareMetal).digest,
            plan(&changed, ExecutionTarget::BareMetal).digest
        );
    }

    #[test]
    fn phases_are_monotonic() {
        let p = plan(&PipelineConfig::default(), ExecutionTarget::Container);
        let mut tracker = crate::phase::PhaseTracker::new();
        for stage in &p.stages {
            tracker.advance(stage.phase).unwrap();
        }
    }
}
