//! prgate - pull-request test gate
//!
//! ## Commands
//!
//! - `prgate run` - Run the gate jobs and record them in the run ledger
//! - `prgate plan` - Print the resolved stage plan of each job
//! - `prgate partition` - Show how the test corpus splits into categories
//! - `prgate gate --run <id>` - Re-evaluate a stored run from its events
//! - `prgate trigger --base <branch>` - Check whether a base branch is gated

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use prgate_core::telemetry::init_tracing;
use prgate_core::{
    CategoryKind, Gate, GateDecision, GatePipeline, JobContext, JobVerdict, PipelineConfig,
    StageStatus, SuitePartitioner, TestCorpus, TriggerFilter,
};
use prgate_env::{ExecutionTarget, ProcessExecutor};
use prgate_ledger::{FsRunLedger, RunId, RunLedger};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "prgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pull-request test gate for the product under test", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON logs and JSON reports
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "PRGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Checkout of the product under test
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gate jobs (both targets unless --target is given)
    Run {
        /// Run a single job: bare-metal or container
        #[arg(short, long)]
        target: Option<ExecutionTarget>,

        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        ledger: LedgerArgs,
    },

    /// Print the stage plan and digest of each job
    Plan {
        #[arg(short, long)]
        target: Option<ExecutionTarget>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Show the category assignment for the test corpus
    Partition {
        #[arg(short, long)]
        target: Option<ExecutionTarget>,

        /// Collector listing to use instead of discovering tests
        #[arg(long)]
        corpus: Option<PathBuf>,
    },

    /// Re-evaluate a stored run from its recorded events
    Gate {
        /// Run ID to evaluate
        #[arg(long)]
        run: String,

        #[command(flatten)]
        ledger: LedgerArgs,
    },

    /// Check whether a pull request into BASE triggers the gate
    Trigger {
        /// Base branch of the pull request
        #[arg(long)]
        base: String,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Base branch the change targets
    #[arg(long, default_value = "master")]
    base: String,

    /// Head branch under review
    #[arg(long, default_value = "HEAD")]
    head: String,

    /// Commit under review (read from git when omitted)
    #[arg(long)]
    sha: Option<String>,

    /// Product version exported to every command
    #[arg(long, env = "PRODUCT_VERSION")]
    product_version: Option<String>,

    /// Collector listing to use instead of discovering tests
    #[arg(long)]
    corpus: Option<PathBuf>,
}

#[derive(Args)]
struct LedgerArgs {
    /// Run ledger directory
    #[arg(long, env = "PRGATE_LEDGER_DIR", default_value = ".prgate")]
    ledger_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            target,
            job,
            ledger,
        } => cmd_run(config, &cli.workspace, target, &job, &ledger.ledger_dir, cli.json).await,
        Commands::Plan { target, job } => cmd_plan(config, &cli.workspace, target, &job, cli.json),
        Commands::Partition { target, corpus } => {
            cmd_partition(&config, &cli.workspace, target, corpus.as_deref(), cli.json)
        }
        Commands::Gate { run, ledger } => cmd_gate(&ledger.ledger_dir, &run, cli.json).await,
        Commands::Trigger { base } => cmd_trigger(&config, &base, cli.json),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => {
            let config = PipelineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn load_corpus(config: &PipelineConfig, workspace: &Path, listing: Option<&Path>) -> Result<TestCorpus> {
    if let Some(listing) = listing {
        let content = std::fs::read_to_string(listing)
            .with_context(|| format!("Failed to read corpus listing {}", listing.display()))?;
        return Ok(TestCorpus::from_lines(&content));
    }
    let root = config
        .category(CategoryKind::General)
        .and_then(|c| c.paths.first())
        .map(String::as_str)
        .unwrap_or("tests/");
    let corpus = TestCorpus::discover(workspace, root)?;
    info!(tests = corpus.len(), root = %root, "test corpus discovered");
    Ok(corpus)
}

fn job_context(workspace: &Path, job: &JobArgs) -> JobContext {
    let sha = job.sha.clone().or_else(|| git_head(workspace));
    JobContext::new(&job.base, &job.head, sha, job.product_version.clone())
}

/// Best-effort lookup of the checked-out commit.
fn git_head(workspace: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workspace)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

fn targets(target: Option<ExecutionTarget>) -> Vec<ExecutionTarget> {
    target.map(|t| vec![t]).unwrap_or_else(|| ExecutionTarget::ALL.to_vec())
}

fn status_mark(passed: bool) -> &'static str {
    if passed {
        "✓ PASSED"
    } else {
        "✗ FAILED"
    }
}

async fn cmd_run(
    config: PipelineConfig,
    workspace: &Path,
    target: Option<ExecutionTarget>,
    job: &JobArgs,
    ledger_dir: &Path,
    json: bool,
) -> Result<()> {
    let corpus = load_corpus(&config, workspace, job.corpus.as_deref())?;
    let ctx = job_context(workspace, job);

    let filter = TriggerFilter::new(&config.trigger);
    if !filter.matches(&ctx.base_ref) {
        println!("Base branch {} does not trigger the gate", ctx.base_ref);
        return Ok(());
    }

    let ledger = FsRunLedger::new(ledger_dir)
        .with_context(|| format!("Failed to open run ledger {}", ledger_dir.display()))?;
    let pipeline = GatePipeline::new(
        config,
        Arc::new(ledger),
        Arc::new(ProcessExecutor::new()),
        workspace,
    );

    let decision = pipeline
        .run_gate(&ctx, &corpus, &targets(target))
        .await
        .context("Gate jobs could not be run")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        print_decision(&decision);
    }

    if !decision.passed {
        anyhow::bail!("Gate failed");
    }
    Ok(())
}

fn print_decision(decision: &GateDecision) {
    for job in &decision.jobs {
        print_job(job);
        println!();
    }
    for target in &decision.missing {
        println!("✗ No verdict for required job {target}");
    }
    if !decision.drift.is_empty() {
        println!("Environment drift:");
        for drift in &decision.drift {
            println!(
                "  - {} passed on {}, failed on {}",
                drift.stage, drift.passed_on, drift.failed_on
            );
        }
    }
    println!("Gate: {}", status_mark(decision.passed));
}

fn print_job(job: &JobVerdict) {
    println!("Job: {}", job.target);
    println!("Run ID: {}", job.run_id);
    println!("Plan: {}", job.plan_digest);
    println!("Status: {}", status_mark(job.passed()));
    println!(
        "Stages: {} passed, {} skipped, {} total ({}ms)",
        job.passed_count(),
        job.skipped_count(),
        job.stages.len(),
        job.duration_ms
    );
    for stage in &job.stages {
        match stage.status {
            StageStatus::Skipped => println!("  - {} (skipped)", stage.name),
            status => {
                let mark = if status == StageStatus::Passed { "✓" } else { "✗" };
                let exit = stage
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                print!("  {} {} ({}ms, exit code: {})", mark, stage.name, stage.duration_ms, exit);
                if let Some(tests) = &stage.tests {
                    print!(" [{} passed, {} failed]", tests.passed, tests.failed);
                }
                if let Some(kind) = &stage.failure {
                    print!(" [{kind}]");
                }
                println!();
            }
        }
    }
    if !job.exclusions.is_empty() {
        println!("Excluded on this target:");
        for exclusion in &job.exclusions {
            println!("  - {} ({})", exclusion.test, exclusion.reason);
        }
    }
    if !job.gate.violations.is_empty() {
        println!("Violations:");
        for violation in &job.gate.violations {
            println!("  - {violation}");
        }
    }
}

fn cmd_plan(
    config: PipelineConfig,
    workspace: &Path,
    target: Option<ExecutionTarget>,
    job: &JobArgs,
    json: bool,
) -> Result<()> {
    let corpus = load_corpus(&config, workspace, job.corpus.as_deref())?;
    let ctx = job_context(workspace, job);
    // Planning never executes, so the ledger and executor are inert.
    let pipeline = GatePipeline::new(
        config,
        Arc::new(prgate_ledger::MemoryRunLedger::new()),
        Arc::new(ProcessExecutor::new()),
        workspace,
    );

    let plans = targets(target)
        .into_iter()
        .map(|t| pipeline.plan(t, &ctx, &corpus))
        .collect::<prgate_core::Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    for plan in &plans {
        println!("Job: {}", plan.target);
        println!("Digest: {}", plan.digest);
        for (i, stage) in plan.stages.iter().enumerate() {
            print!("  {:>2}. {} [{}]", i + 1, stage.name, stage.phase);
            if let Some(workers) = stage.workers {
                print!(" workers={workers}");
            }
            if let Some(count) = stage.test_count {
                print!(" tests={count}");
            }
            println!();
            for command in &stage.commands {
                println!("        $ {command}");
            }
        }
        println!();
    }
    Ok(())
}

fn cmd_partition(
    config: &PipelineConfig,
    workspace: &Path,
    target: Option<ExecutionTarget>,
    listing: Option<&Path>,
    json: bool,
) -> Result<()> {
    let corpus = load_corpus(config, workspace, listing)?;
    let partitioner = SuitePartitioner::new(config);

    let partitions = targets(target)
        .into_iter()
        .map(|t| partitioner.partition(t, &corpus))
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&partitions)?);
        return Ok(());
    }

    println!("Corpus: {} tests", corpus.len());
    for partition in &partitions {
        println!();
        println!("Job: {}", partition.target);
        for assignment in &partition.assignments {
            println!(
                "  {:<20} {:>4} tests  workers={}  isolation={:?}",
                assignment.label(),
                assignment.test_count(),
                assignment.workers,
                assignment.isolation
            );
            for ignore in &assignment.ignores {
                println!("      ignore {ignore}");
            }
            for exclusion in &assignment.deselected {
                println!("      deselect {} ({})", exclusion.test, exclusion.reason);
            }
        }
    }
    Ok(())
}

async fn cmd_gate(ledger_dir: &Path, run: &str, json: bool) -> Result<()> {
    let ledger = FsRunLedger::new(ledger_dir)
        .with_context(|| format!("Failed to open run ledger {}", ledger_dir.display()))?;
    let run_id = RunId(run.to_string());

    let record = ledger
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run {run} not found"))?;
    let events = ledger.get_events(&run_id).await?;
    let verdict = Gate::evaluate_events(&events);

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        println!("Run: {}", record.run_id);
        println!("Job: {}", record.metadata.job_name);
        println!("Plan: {}", record.plan_digest);
        println!("Events: {}", events.len());
        println!("Status: {}", status_mark(verdict.passed));
        println!("{}", verdict.message);
        if !verdict.violations.is_empty() {
            println!("Violations:");
            for violation in &verdict.violations {
                println!("  - {violation}");
            }
        }
    }

    if !verdict.passed {
        anyhow::bail!("Gate failed for run {run}");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TriggerReport<'a> {
    base_ref: &'a str,
    triggers: bool,
}

fn cmd_trigger(config: &PipelineConfig, base: &str, json: bool) -> Result<()> {
    let triggers = TriggerFilter::new(&config.trigger).matches(base);

    if json {
        let report = TriggerReport {
            base_ref: base,
            triggers,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if triggers {
        println!("✓ Pull requests into {base} run the gate");
    } else {
        println!("✗ Pull requests into {base} are not gated");
    }

    if !triggers {
        anyhow::bail!("Base branch {base} does not trigger the gate");
    }
    Ok(())
}
