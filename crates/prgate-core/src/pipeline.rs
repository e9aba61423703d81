//! Job orchestration.
//!
//! One routine runs a job for either target: resolve the partition and plan,
//! build the job's `Environment`, then execute stages strictly in order under
//! the outer job deadline. The container target differs only in its plan
//! (image build, container start, source sync) and in the executor its
//! environment routes commands through.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use prgate_env::{
    CommandExecutor, CommandOutput, CommandSpec, Environment, EnvironmentProvisioner,
    ExecutionTarget, ProvisionError, ProvisionStep, StepKind,
};
use prgate_ledger::{RunLedger, RunMetadata};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::PipelineConfig;
use crate::error::{FailureKind, GateError, Result};
use crate::gate::{Gate, GateDecision, JobVerdict};
use crate::partition::{Partition, SuitePartitioner, TestCorpus};
use crate::phase::PhaseTracker;
use crate::plan::JobPlan;
use crate::recording::{JobEvent, JobRecorder};
use crate::replay::ContainerReplay;
use crate::runner::{SuiteRunner, TestCounts};
use crate::stage::{Stage, StageAction, StageOutcome, StageStatus};
use crate::telemetry::{self, JobSpan};
use crate::trigger::{PullRequestEvent, TriggerFilter};

/// What the job is validating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub base_ref: String,
    pub head_ref: String,
    pub head_sha: Option<String>,
    /// Product version pin, exported to every command for tagging.
    pub product_version: Option<String>,
}

impl JobContext {
    pub fn new(
        base_ref: impl Into<String>,
        head_ref: impl Into<String>,
        head_sha: Option<String>,
        product_version: Option<String>,
    ) -> Self {
        Self {
            base_ref: base_ref.into(),
            head_ref: head_ref.into(),
            head_sha,
            product_version,
        }
    }

    pub fn from_event(event: &PullRequestEvent, product_version: Option<String>) -> Self {
        Self {
            base_ref: event.base_ref.clone(),
            head_ref: event.head_ref.clone(),
            head_sha: event.head_sha.clone(),
            product_version,
        }
    }

    /// Short, stable tag for image and container names.
    pub fn tag(&self) -> String {
        if let Some(sha) = &self.head_sha {
            return sha.chars().take(12).collect::<String>().to_ascii_lowercase();
        }
        let tag: String = self
            .head_ref
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let tag = tag.trim_matches('-');
        if tag.is_empty() {
            "local".to_string()
        } else {
            tag.to_string()
        }
    }

    /// The commit if known, else the remote-tracking branch.
    pub fn checkout_target(&self, remote: &str) -> String {
        match &self.head_sha {
            Some(sha) => sha.clone(),
            None => format!("{}/{}", remote, self.head_ref),
        }
    }
}

/// Output of one stage attempt.
#[derive(Debug, Default)]
struct StageRun {
    output: CommandOutput,
    tests: Option<TestCounts>,
}

/// Per-job collaborators handed to every stage.
struct StageContext<'a> {
    partition: &'a Partition,
    host_env: &'a Environment,
    provisioner: &'a EnvironmentProvisioner,
    runner: &'a SuiteRunner,
}

/// Runs gate jobs and records them in the ledger.
pub struct GatePipeline {
    config: PipelineConfig,
    ledger: Arc<dyn RunLedger>,
    host: Arc<dyn CommandExecutor>,
    workspace: PathBuf,
}

impl GatePipeline {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<dyn RunLedger>,
        host: Arc<dyn CommandExecutor>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            ledger,
            host,
            workspace: workspace.into(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn partition(&self, target: ExecutionTarget, corpus: &TestCorpus) -> Result<Partition> {
        Ok(SuitePartitioner::new(&self.config).partition(target, corpus)?)
    }

    pub fn plan(
        &self,
        target: ExecutionTarget,
        ctx: &JobContext,
        corpus: &TestCorpus,
    ) -> Result<JobPlan> {
        let partition = self.partition(target, corpus)?;
        let replay = self.replay_for(target, ctx);
        Ok(JobPlan::build(&self.config, &partition, ctx, replay.as_ref()))
    }

    fn replay_for(&self, target: ExecutionTarget, ctx: &JobContext) -> Option<ContainerReplay> {
        match target {
            ExecutionTarget::Container => Some(ContainerReplay::new(&self.config, ctx)),
            ExecutionTarget::BareMetal => None,
        }
    }

    /// Run the pull-request gate if the event's base branch triggers it.
    /// Returns `None` when the event is filtered out.
    pub async fn run_pull_request(
        &self,
        event: &PullRequestEvent,
        corpus: &TestCorpus,
        product_version: Option<String>,
    ) -> Result<Option<GateDecision>> {
        if !TriggerFilter::new(&self.config.trigger).accepts(event) {
            info!(base_ref = %event.base_ref, "base branch does not trigger the gate");
            return Ok(None);
        }
        let ctx = JobContext::from_event(event, product_version);
        self.run_gate(&ctx, corpus, &ExecutionTarget::ALL)
            .await
            .map(Some)
    }

    /// Run one job per target concurrently and decide the gate. Jobs share
    /// nothing but the ledger; a job that cannot be run fails on its own
    /// and leaves the other verdicts intact.
    pub async fn run_gate(
        &self,
        ctx: &JobContext,
        corpus: &TestCorpus,
        targets: &[ExecutionTarget],
    ) -> Result<GateDecision> {
        let jobs = targets.iter().map(|t| self.run_job(*t, ctx, corpus));
        let results = futures::future::join_all(jobs).await;

        let verdicts: Vec<JobVerdict> = targets
            .iter()
            .zip(results)
            .map(|(target, result)| {
                result.unwrap_or_else(|e| {
                    error!(job = %target, error = %e, "job could not be run");
                    JobVerdict::aborted(*target, &e)
                })
            })
            .collect();

        let decision = Gate::decide(verdicts, targets);
        for drift in &decision.drift {
            warn!(
                stage = %drift.stage,
                passed_on = %drift.passed_on,
                failed_on = %drift.failed_on,
                "environment drift"
            );
        }
        telemetry::emit_gate_evaluated(decision.jobs.len(), decision.drift.len(), decision.passed);
        Ok(decision)
    }

    /// Run a single job. `Err` means the job could not be run or recorded;
    /// stage failures are reported through the verdict.
    pub async fn run_job(
        &self,
        target: ExecutionTarget,
        ctx: &JobContext,
        corpus: &TestCorpus,
    ) -> Result<JobVerdict> {
        let partition = self.partition(target, corpus)?;
        let replay = self.replay_for(target, ctx);
        let plan = JobPlan::build(&self.config, &partition, ctx, replay.as_ref());

        let mut env = match &replay {
            Some(replay) => replay.environment(self.host.clone()),
            None => Environment::new(ExecutionTarget::BareMetal, &self.workspace, self.host.clone()),
        };
        if let Some(version) = &ctx.product_version {
            env = env.with_env_var(&self.config.product.version_env, version);
        }
        let host_env =
            Environment::new(ExecutionTarget::BareMetal, &self.workspace, self.host.clone());

        let verdict = self.execute(&plan, &partition, &mut env, &host_env, ctx).await;

        if let Some(replay) = &replay {
            let started = match &verdict {
                Ok(v) => v.stages.iter().any(|s| {
                    s.action == StageAction::StartContainer && s.status != StageStatus::Skipped
                }),
                Err(_) => true,
            };
            if started {
                replay.teardown(self.host.as_ref()).await;
            }
        }
        verdict
    }

    async fn execute(
        &self,
        plan: &JobPlan,
        partition: &Partition,
        env: &mut Environment,
        host_env: &Environment,
        ctx: &JobContext,
    ) -> Result<JobVerdict> {
        let start = Instant::now();
        let job = plan.target.name();
        let metadata = RunMetadata {
            git_sha: ctx.head_sha.clone(),
            job_name: job.to_string(),
            tags: json!({
                "base_ref": &ctx.base_ref,
                "head_ref": &ctx.head_ref,
                "product_version": &ctx.product_version,
                "stages": plan.stage_names(),
            }),
        };
        let recorder =
            JobRecorder::start(self.ledger.clone(), &plan.digest, metadata, plan.stages.len())
                .await?;
        let run_id = recorder.run_id().to_string();
        let span = JobSpan::new(job, &run_id);

        let result = self
            .execute_stages(plan, partition, env, host_env, &recorder)
            .instrument(span.span())
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok((stages, phases)) => {
                let gate = Gate::evaluate_job(&stages);
                if gate.passed {
                    recorder.finish_ok(duration_ms).await?;
                } else {
                    recorder.finish_err(duration_ms).await?;
                }
                Ok(JobVerdict {
                    run_id,
                    target: plan.target,
                    plan_digest: plan.digest.to_string(),
                    stages,
                    gate,
                    exclusions: partition.exclusions().cloned().collect(),
                    phases,
                    duration_ms,
                })
            }
            Err(e) => {
                if let Err(finalize) = recorder.finish_err(duration_ms).await {
                    telemetry::emit_run_finalize_error(&run_id, &finalize);
                }
                Err(e)
            }
        }
    }

    async fn execute_stages(
        &self,
        plan: &JobPlan,
        partition: &Partition,
        env: &mut Environment,
        host_env: &Environment,
        recorder: &JobRecorder,
    ) -> Result<(Vec<StageOutcome>, Vec<crate::phase::JobPhase>)> {
        let policy = &self.config.policy;
        let platform = match plan.target {
            ExecutionTarget::BareMetal => self.config.platform.clone(),
            ExecutionTarget::Container => self.config.container_platform(),
        };
        let runner = SuiteRunner::new(self.config.test_tool.clone(), &platform.cache_server.name);
        let provisioner = EnvironmentProvisioner::new(platform);
        let stage_ctx = StageContext {
            partition,
            host_env,
            provisioner: &provisioner,
            runner: &runner,
        };

        if partition.total_tests() == 0 {
            warn!(job = %plan.target, "no tests selected on this target");
        }

        for exclusion in partition.exclusions() {
            info!(
                category = %exclusion.category,
                test = %exclusion.test,
                reason = %exclusion.reason,
                "test excluded on this target"
            );
            recorder
                .record(JobEvent::ExclusionNoted {
                    category: exclusion.category.label().to_string(),
                    test: exclusion.test.clone(),
                    reason: exclusion.reason.clone(),
                })
                .await?;
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(policy.job_timeout_secs);
        let mut tracker = PhaseTracker::new();
        let mut outcomes = Vec::with_capacity(plan.stages.len());
        let mut halted: Option<String> = None;

        for stage in &plan.stages {
            if let Some(reason) = &halted {
                debug!(stage = %stage.name, reason = %reason, "skipping stage");
                recorder
                    .record(JobEvent::StageSkipped {
                        stage: stage.name.clone(),
                        reason: reason.clone(),
                    })
                    .await?;
                telemetry::emit_stage_finished(&stage.name, "skipped", None, 0);
                outcomes.push(StageOutcome::skipped(stage));
                continue;
            }

            tracker.advance(stage.phase)?;
            recorder
                .record(JobEvent::StageStarted {
                    stage: stage.name.clone(),
                    phase: stage.phase.to_string(),
                    commands: stage.commands.iter().map(|c| c.to_string()).collect(),
                })
                .await?;
            info!(stage = %stage.name, phase = %stage.phase, "executing stage");

            let outcome = self.run_with_retries(stage, &stage_ctx, env, deadline).await;

            if outcome.passed() {
                recorder
                    .record(JobEvent::StagePassed {
                        stage: stage.name.clone(),
                        exit_code: outcome.exit_code,
                        duration_ms: outcome.duration_ms,
                        attempts: outcome.attempts,
                        tests: outcome.tests,
                    })
                    .await?;
                telemetry::emit_stage_finished(
                    &stage.name,
                    "passed",
                    outcome.exit_code,
                    outcome.duration_ms,
                );
            } else {
                let failure = outcome.failure.unwrap_or(FailureKind::Internal);
                recorder
                    .record(JobEvent::StageFailed {
                        stage: stage.name.clone(),
                        exit_code: outcome.exit_code,
                        failure,
                        error: outcome.error.clone(),
                        stdout: outcome.stdout.clone(),
                        stderr: outcome.stderr.clone(),
                        duration_ms: outcome.duration_ms,
                        attempts: outcome.attempts,
                    })
                    .await?;
                telemetry::emit_stage_finished(
                    &stage.name,
                    "failed",
                    outcome.exit_code,
                    outcome.duration_ms,
                );
                warn!(
                    stage = %stage.name,
                    failure = %failure,
                    exit_code = outcome.exit_code,
                    stderr = %outcome.stderr.trim(),
                    "stage failed"
                );

                if failure == FailureKind::Deadline {
                    halted = Some(format!(
                        "job deadline of {}s exceeded",
                        policy.job_timeout_secs
                    ));
                } else if policy.fail_fast {
                    halted = Some(format!("stage {} failed", stage.name));
                }
            }
            outcomes.push(outcome);
        }

        let passed = outcomes.iter().all(StageOutcome::passed);
        tracker.conclude(passed)?;
        Ok((outcomes, tracker.history().to_vec()))
    }

    /// Run a stage, re-attempting only when retries are configured. Every
    /// retry is logged; a deadline is never retried.
    async fn run_with_retries(
        &self,
        stage: &Stage,
        ctx: &StageContext<'_>,
        env: &mut Environment,
        deadline: tokio::time::Instant,
    ) -> StageOutcome {
        let max_retries = self.config.policy.max_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result =
                match tokio::time::timeout_at(deadline, self.run_stage(stage, ctx, env)).await {
                    Ok(result) => result,
                    Err(_) => Err(GateError::Deadline {
                        secs: self.config.policy.job_timeout_secs,
                    }),
                };
            let mut outcome = outcome_from(stage, result, started.elapsed());
            outcome.attempts = attempt;

            if outcome.passed()
                || attempt > max_retries
                || outcome.failure == Some(FailureKind::Deadline)
            {
                return outcome;
            }
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("exit code {}", outcome.exit_code.unwrap_or(-1)));
            telemetry::emit_stage_retry(&stage.name, attempt, max_retries, &error);
        }
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        ctx: &StageContext<'_>,
        env: &mut Environment,
    ) -> Result<StageRun> {
        match stage.action {
            StageAction::Provision(kind) => {
                let step = ProvisionStep {
                    kind,
                    commands: stage.commands.clone(),
                };
                let report = ctx.provisioner.apply_step(env, &step).await?;
                if report.skipped {
                    debug!(stage = %stage.name, "provisioning step already applied");
                } else if kind == StepKind::VerifyCacheServer {
                    ctx.provisioner.finish(env);
                }
                Ok(StageRun {
                    output: report.output,
                    tests: None,
                })
            }
            StageAction::RunCategory(kind) => {
                let assignment = ctx.partition.assignment(kind).ok_or_else(|| {
                    GateError::Config(format!("no assignment for category {}", kind))
                })?;
                let run = ctx.runner.run(env, assignment).await?;
                Ok(StageRun {
                    output: run.output,
                    tests: run.counts,
                })
            }
            action if action.runs_on_host() => {
                let run = run_commands(ctx.host_env, &stage.commands).await?;
                if !run.output.success() {
                    return Err(GateError::Build {
                        exit_code: run.output.exit_code,
                        stderr: run.output.stderr,
                    });
                }
                Ok(run)
            }
            _ => run_commands(env, &stage.commands).await,
        }
    }
}

/// Run commands in order, stopping at the first non-zero exit.
async fn run_commands(env: &Environment, commands: &[CommandSpec]) -> Result<StageRun> {
    let mut combined = CommandOutput::default();
    for command in commands {
        debug!(command = %command, "running");
        let output = env.run(command).await?;
        combined.stdout.push_str(&output.stdout);
        combined.stderr.push_str(&output.stderr);
        combined.duration_ms += output.duration_ms;
        combined.exit_code = output.exit_code;
        if !output.success() {
            break;
        }
    }
    Ok(StageRun {
        output: combined,
        tests: None,
    })
}

fn outcome_from(stage: &Stage, result: Result<StageRun>, elapsed: Duration) -> StageOutcome {
    let duration_ms = elapsed.as_millis() as u64;
    match result {
        Ok(run) => {
            let passed = run.output.success();
            StageOutcome {
                name: stage.name.clone(),
                action: stage.action,
                status: if passed {
                    StageStatus::Passed
                } else {
                    StageStatus::Failed
                },
                exit_code: Some(run.output.exit_code),
                stdout: run.output.stdout,
                stderr: run.output.stderr,
                duration_ms,
                attempts: 1,
                failure: (!passed).then(|| stage.action.failure_kind()),
                error: None,
                tests: run.tests,
            }
        }
        Err(e) => {
            let mut outcome = StageOutcome::errored(stage, e.failure_kind(), e.to_string(), duration_ms);
            match &e {
                GateError::Provisioning(ProvisionError::StepFailed {
                    exit_code, stderr, ..
                })
                | GateError::Build { exit_code, stderr } => {
                    outcome.exit_code = Some(*exit_code);
                    outcome.stderr = stderr.clone();
                }
                _ => {}
            }
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prgate_env::fakes::ScriptedExecutor;
    use prgate_ledger::MemoryRunLedger;

    fn corpus() -> TestCorpus {
        TestCorpus::new([
            "tests/test_a.py::test_one",
            "tests/test_database.py::test_put",
            "tests/test_daemon.py::test_stop",
            "tests/integration_tests/test_dataset.py::test_pcap",
            "tests/integration_tests/test_config_files.py::test_yaml",
        ])
    }

    fn ctx() -> JobContext {
        JobContext::new("master", "feature/x", Some("feedface00112233".into()), Some("1.0.7".into()))
    }

    fn pipeline(exec: Arc<ScriptedExecutor>, config: PipelineConfig) -> GatePipeline {
        GatePipeline::new(config, Arc::new(MemoryRunLedger::new()), exec, "/work")
    }

    #[test]
    fn tag_prefers_sha() {
        assert_eq!(ctx().tag(), "feedface0011");
        let branch = JobContext::new("master", "Feature/Zeek_6", None, None);
        assert_eq!(branch.tag(), "feature-zeek-6");
        assert_eq!(JobContext::new("master", "", None, None).tag(), "local");
    }

    #[tokio::test]
    async fn passing_job_walks_every_phase() {
        let exec = Arc::new(ScriptedExecutor::new());
        let p = pipeline(exec.clone(), PipelineConfig::default());

        let verdict = p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();
        assert!(verdict.passed(), "{:?}", verdict.gate.violations);
        assert_eq!(verdict.stages.len(), 12);
        assert_eq!(verdict.phases.last(), Some(&crate::phase::JobPhase::Passed));
        assert!(verdict.phases.contains(&crate::phase::JobPhase::CacheFlush));
    }

    #[tokio::test]
    async fn version_pin_reaches_every_command() {
        let exec = Arc::new(ScriptedExecutor::new());
        let p = pipeline(exec.clone(), PipelineConfig::default());
        p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();

        for invocation in exec.invocations() {
            assert_eq!(invocation.env.get("SLIPS_VERSION").map(String::as_str), Some("1.0.7"));
        }
    }

    #[tokio::test]
    async fn fail_fast_skips_the_rest() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail_on("pytest tests/test_database.py", 1);
        let p = pipeline(exec.clone(), PipelineConfig::default());

        let verdict = p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();
        assert!(!verdict.passed());
        assert_eq!(verdict.first_failure().unwrap().name, "test_storage");
        assert_eq!(verdict.skipped_count(), 4);
        assert!(!exec.was_invoked("slips.py -cc"));
        assert_eq!(verdict.phases.last(), Some(&crate::phase::JobPhase::Failed));
    }

    #[tokio::test]
    async fn without_fail_fast_later_stages_still_run() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail_on("pytest tests/test_database.py", 1);
        let mut config = PipelineConfig::default();
        config.policy.fail_fast = false;
        let p = pipeline(exec.clone(), config);

        let verdict = p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();
        assert!(!verdict.passed());
        assert_eq!(verdict.skipped_count(), 0);
        assert!(exec.was_invoked("slips.py -cc"));
    }

    #[tokio::test]
    async fn no_retry_by_default() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail_on("pytest tests/test_database.py", 1);
        let p = pipeline(exec.clone(), PipelineConfig::default());

        let verdict = p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();
        assert_eq!(exec.count_matching("pytest tests/test_database.py"), 1);
        assert_eq!(verdict.first_failure().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn configured_retries_are_counted() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail_on("pytest tests/test_database.py", 1);
        let mut config = PipelineConfig::default();
        config.policy.max_retries = 2;
        let p = pipeline(exec.clone(), config);

        let verdict = p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();
        assert_eq!(exec.count_matching("pytest tests/test_database.py"), 3);
        assert_eq!(verdict.first_failure().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn provisioning_failure_is_terminal() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail_on("install zeek", 100);
        let p = pipeline(exec.clone(), PipelineConfig::default());

        let verdict = p.run_job(ExecutionTarget::BareMetal, &ctx(), &corpus()).await.unwrap();
        let failure = verdict.first_failure().unwrap();
        assert_eq!(failure.name, "install_traffic_engine");
        assert_eq!(failure.failure, Some(FailureKind::Provisioning));
        assert_eq!(failure.exit_code, Some(100));
        assert!(!exec.was_invoked("pytest"));
    }

    #[tokio::test]
    async fn filtered_event_runs_nothing() {
        let exec = Arc::new(ScriptedExecutor::new());
        let p = pipeline(exec.clone(), PipelineConfig::default());
        let event = PullRequestEvent {
            base_ref: "develop".into(),
            head_ref: "feature/x".into(),
            head_sha: None,
        };

        let decision = p.run_pull_request(&event, &corpus(), None).await.unwrap();
        assert!(decision.is_none());
        assert!(exec.invocations().is_empty());
    }
}
