//! Scripted command executor (testing only)
//!
//! `ScriptedExecutor` records every invocation and answers from a list of
//! substring rules, so pipelines can be exercised without the real package
//! manager, test tool or container runtime.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::exec::{CommandExecutor, CommandOutput, Invocation};

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    exit_code: i32,
    stdout: String,
    delay: Option<Duration>,
}

/// Executor that never spawns anything. Unmatched commands succeed with empty
/// output; the first rule whose pattern occurs in the command line wins.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with `exit_code`.
    pub fn fail_on(&self, pattern: &str, exit_code: i32) {
        self.push(Rule {
            pattern: pattern.to_string(),
            exit_code,
            stdout: String::new(),
            delay: None,
        });
    }

    /// Commands containing `pattern` succeed and print `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.push(Rule {
            pattern: pattern.to_string(),
            exit_code: 0,
            stdout: stdout.to_string(),
            delay: None,
        });
    }

    /// Commands containing `pattern` succeed after sleeping for `delay`.
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.push(Rule {
            pattern: pattern.to_string(),
            exit_code: 0,
            stdout: String::new(),
            delay: Some(delay),
        });
    }

    fn push(&self, rule: Rule) {
        self.rules.lock().unwrap().push(rule);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Command lines in invocation order.
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    pub fn was_invoked(&self, pattern: &str) -> bool {
        self.count_matching(pattern) > 0
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    /// Index of the first invocation containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.command_lines()
            .iter()
            .position(|line| line.contains(pattern))
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        if invocation.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        self.invocations.lock().unwrap().push(invocation.clone());

        let line = invocation.command_line();
        let rule = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| line.contains(&r.pattern))
            .cloned();

        match rule {
            Some(rule) => {
                if let Some(delay) = rule.delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(CommandOutput {
                    exit_code: rule.exit_code,
                    stdout: rule.stdout,
                    stderr: if rule.exit_code == 0 {
                        String::new()
                    } else {
                        format!("scripted failure for `{}`", rule.pattern)
                    },
                    duration_ms: 0,
                })
            }
            None => Ok(CommandOutput::default()),
        }
    }
}
