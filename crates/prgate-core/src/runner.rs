//! Category execution through the test tool.

use prgate_env::{CommandOutput, CommandSpec, Environment};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TestToolConfig;
use crate::error::GateError;
use crate::partition::{CategoryAssignment, Isolation};

/// Counts from the test tool's closing summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
    pub deselected: u32,
}

impl TestCounts {
    /// Parse the last summary line of the output, e.g.
    /// `=== 2 failed, 68 passed, 3 warnings in 12.34s ===`.
    pub fn parse(output: &str) -> Option<Self> {
        let line = output.lines().rev().map(str::trim).find(|line| {
            line.contains(" in ")
                && ["passed", "failed", "error", "no tests ran", "deselected"]
                    .iter()
                    .any(|w| line.contains(w))
        })?;

        let body = line.trim_matches('=').trim();
        let mut counts = TestCounts::default();
        let mut seen = false;
        for part in body.split(',') {
            let mut words = part.split_whitespace();
            let (Some(n), Some(word)) = (words.next(), words.next()) else {
                continue;
            };
            let Ok(n) = n.parse::<u32>() else {
                continue;
            };
            seen = true;
            match word {
                "passed" => counts.passed = n,
                "failed" => counts.failed = n,
                "skipped" => counts.skipped = n,
                "error" | "errors" => counts.errors = n,
                "deselected" => counts.deselected = n,
                _ => {}
            }
        }
        if seen || body.starts_with("no tests ran") {
            Some(counts)
        } else {
            None
        }
    }

    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.skipped + self.errors
    }
}

/// What a category run produced.
#[derive(Debug, Clone, Default)]
pub struct CategoryRun {
    pub output: CommandOutput,
    pub counts: Option<TestCounts>,
}

impl CategoryRun {
    pub fn passed(&self) -> bool {
        self.output.success()
    }
}

/// Runs one category at its worker count.
pub struct SuiteRunner {
    tool: TestToolConfig,
    cache_service: String,
}

impl SuiteRunner {
    pub fn new(tool: TestToolConfig, cache_service: impl Into<String>) -> Self {
        Self {
            tool,
            cache_service: cache_service.into(),
        }
    }

    /// The test tool invocation for a category.
    pub fn command(&self, assignment: &CategoryAssignment) -> CommandSpec {
        let mut argv = self.tool.program.clone();
        argv.extend(assignment.paths.iter().cloned());
        for ignore in &assignment.ignores {
            argv.push(format!("{}={}", self.tool.ignore_flag, ignore));
        }
        for exclusion in &assignment.deselected {
            argv.push(self.tool.deselect_flag.clone());
            argv.push(exclusion.test.clone());
        }
        argv.push(self.tool.workers_flag.clone());
        argv.push(assignment.workers.to_string());
        argv.extend(self.tool.quiet_warnings.iter().cloned());
        argv.extend(self.tool.verbosity.iter().cloned());
        CommandSpec::Argv(argv)
    }

    /// Check the category's isolation requirement against the environment.
    pub fn check_isolation(
        &self,
        env: &Environment,
        assignment: &CategoryAssignment,
    ) -> Result<(), GateError> {
        match assignment.isolation {
            Isolation::None => Ok(()),
            Isolation::CacheServer if env.service_ready(&self.cache_service) => Ok(()),
            Isolation::CacheServer => Err(GateError::Precondition {
                category: assignment.label().to_string(),
                reason: format!("cache server {} is not ready", self.cache_service),
            }),
            Isolation::ExclusiveProcess if assignment.workers == 1 => Ok(()),
            Isolation::ExclusiveProcess => Err(GateError::Precondition {
                category: assignment.label().to_string(),
                reason: format!(
                    "exclusive process ownership needs 1 worker, got {}",
                    assignment.workers
                ),
            }),
        }
    }

    pub async fn run(
        &self,
        env: &Environment,
        assignment: &CategoryAssignment,
    ) -> Result<CategoryRun, GateError> {
        self.check_isolation(env, assignment)?;

        // The test tool fails a run that collects nothing; so does the gate.
        if assignment.tests.is_empty() {
            warn!(category = assignment.label(), "category selects no tests");
            return Err(GateError::Precondition {
                category: assignment.label().to_string(),
                reason: "no tests selected".to_string(),
            });
        }

        let command = self.command(assignment);
        debug!(category = assignment.label(), command = %command, "running category");
        let output = env.run(&command).await?;
        let counts = TestCounts::parse(&output.stdout);

        info!(
            category = assignment.label(),
            workers = assignment.workers,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            passed = counts.map(|c| c.passed),
            failed = counts.map(|c| c.failed),
            "category finished"
        );

        Ok(CategoryRun { output, counts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Exclusion, PipelineConfig};
    use crate::partition::CategoryKind;
    use prgate_env::fakes::ScriptedExecutor;
    use prgate_env::ExecutionTarget;
    use std::sync::Arc;

    fn runner() -> SuiteRunner {
        SuiteRunner::new(PipelineConfig::default().test_tool, "redis")
    }

    fn assignment(kind: CategoryKind, isolation: Isolation, workers: u32) -> CategoryAssignment {
        CategoryAssignment {
            kind,
            paths: vec!["tests/test_daemon.py".into()],
            ignores: vec![],
            deselected: vec![],
            tests: vec!["tests/test_daemon.py::test_stop".into()],
            workers,
            isolation,
        }
    }

    #[test]
    fn command_carries_filters_and_flags() {
        let mut a = assignment(CategoryKind::General, Isolation::None, 7);
        a.paths = vec!["tests/".into()];
        a.ignores = vec!["tests/test_database.py".into()];
        a.deselected = vec![Exclusion {
            category: CategoryKind::General,
            test: "tests/test_x.py::test_y".into(),
            reason: "n/a".into(),
        }];

        let argv = runner().command(&a).to_argv();
        assert_eq!(
            argv,
            vec![
                "python3",
                "-m",
                "pytest",
                "tests/",
                "--ignore=tests/test_database.py",
                "--deselect",
                "tests/test_x.py::test_y",
                "-n",
                "7",
                "-p",
                "no:warnings",
                "-vv",
                "-s",
            ]
        );
    }

    #[test]
    fn parses_summary_line() {
        let out = "collected 73 items\n...\n===== 2 failed, 68 passed, 1 skipped, 4 warnings in 12.34s =====\n";
        let counts = TestCounts::parse(out).unwrap();
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.passed, 68);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.total(), 71);
    }

    #[test]
    fn parses_error_summary() {
        let counts = TestCounts::parse("== 1 error in 0.50s ==").unwrap();
        assert_eq!(counts.errors, 1);
    }

    #[test]
    fn missing_summary_is_none() {
        assert!(TestCounts::parse("Traceback (most recent call last):").is_none());
    }

    #[tokio::test]
    async fn cache_server_category_needs_ready_service() {
        let exec = Arc::new(ScriptedExecutor::new());
        let env = Environment::new(ExecutionTarget::BareMetal, "/work", exec.clone());
        let a = assignment(CategoryKind::Storage, Isolation::CacheServer, 1);

        let err = runner().run(&env, &a).await.unwrap_err();
        assert!(matches!(err, GateError::Precondition { .. }));
        assert!(exec.invocations().is_empty());
    }

    #[tokio::test]
    async fn empty_category_fails_without_invoking_tool() {
        let exec = Arc::new(ScriptedExecutor::new());
        let env = Environment::new(ExecutionTarget::BareMetal, "/work", exec.clone());
        let mut a = assignment(CategoryKind::Daemon, Isolation::ExclusiveProcess, 1);
        a.tests.clear();

        let err = runner().run(&env, &a).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Precondition { ref category, .. } if category == "daemon"
        ));
        assert!(exec.invocations().is_empty());
    }

    #[tokio::test]
    async fn failing_tool_exit_is_reported() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail_on("pytest", 1);
        let env = Environment::new(ExecutionTarget::BareMetal, "/work", exec.clone());
        let a = assignment(CategoryKind::Daemon, Isolation::ExclusiveProcess, 1);

        let run = runner().run(&env, &a).await.unwrap();
        assert!(!run.passed());
        assert_eq!(run.output.exit_code, 1);
        assert_eq!(exec.count_matching("pytest tests/test_daemon.py"), 1);
    }
}
