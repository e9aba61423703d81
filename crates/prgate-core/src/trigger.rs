//! Pull-request trigger filtering.

use serde::{Deserialize, Serialize};

use crate::config::TriggerConfig;

/// The part of a pull-request event the gate looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    /// Branch the PR targets.
    pub base_ref: String,
    /// Branch the PR comes from.
    pub head_ref: String,
    /// Commit under review.
    pub head_sha: Option<String>,
}

/// Base-branch filter. Exclusions win over inclusions; a trailing `*`
/// matches any suffix.
#[derive(Debug, Clone)]
pub struct TriggerFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TriggerFilter {
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
        }
    }

    pub fn matches(&self, base_ref: &str) -> bool {
        let branch = base_ref.strip_prefix("refs/heads/").unwrap_or(base_ref);
        if self.exclude.iter().any(|p| glob_match(p, branch)) {
            return false;
        }
        self.include.iter().any(|p| glob_match(p, branch))
    }

    pub fn accepts(&self, event: &PullRequestEvent) -> bool {
        self.matches(&event.base_ref)
    }
}

fn glob_match(pattern: &str, branch: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => pattern == branch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> TriggerFilter {
        TriggerFilter::new(&TriggerConfig::default())
    }

    #[test]
    fn master_triggers() {
        assert!(filter().matches("master"));
        assert!(filter().matches("refs/heads/master"));
    }

    #[test]
    fn develop_does_not_trigger() {
        assert!(!filter().matches("develop"));
    }

    #[test]
    fn unlisted_branch_does_not_trigger() {
        assert!(!filter().matches("feature/x"));
    }

    #[test]
    fn exclusion_beats_wildcard_inclusion() {
        let filter = TriggerFilter::new(&TriggerConfig {
            include: vec!["release/*".into()],
            exclude: vec!["release/experimental*".into()],
        });
        assert!(filter.matches("release/1.0"));
        assert!(!filter.matches("release/experimental-2"));
    }
}
