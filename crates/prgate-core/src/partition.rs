//! Test corpus discovery and partitioning.
//!
//! The corpus is split into disjoint categories. Every non-general category
//! selects explicit paths; the general category takes whatever remains under
//! its root and excludes the others by filter, so no test is collected twice
//! and none is dropped.

use std::collections::BTreeSet;
use std::path::Path;

use prgate_env::ExecutionTarget;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Exclusion, PipelineConfig};
use crate::error::{GateError, PartitionError};

/// Test categories, in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    General,
    Storage,
    Daemon,
    DatasetIntegration,
    ConfigIntegration,
}

impl CategoryKind {
    pub fn label(&self) -> &'static str {
        match self {
            CategoryKind::General => "general",
            CategoryKind::Storage => "storage",
            CategoryKind::Daemon => "daemon",
            CategoryKind::DatasetIntegration => "dataset_integration",
            CategoryKind::ConfigIntegration => "config_integration",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            CategoryKind::General | CategoryKind::Storage | CategoryKind::Daemon => Phase::Unit,
            CategoryKind::DatasetIntegration | CategoryKind::ConfigIntegration => {
                Phase::Integration
            }
        }
    }
}

impl std::fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Unit categories run before the cache flush, integration ones after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unit,
    Integration,
}

/// What a category needs from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    None,
    /// The cache server must be up and answering.
    CacheServer,
    /// The category owns the product process; one worker only.
    ExclusiveProcess,
}

impl Isolation {
    pub fn requires_serial(&self) -> bool {
        matches!(self, Isolation::ExclusiveProcess)
    }
}

/// The set of test ids under consideration.
///
/// Ids are either file paths (`tests/test_x.py`) or node ids
/// (`tests/test_x.py::test_case`), always with `/` separators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCorpus {
    tests: BTreeSet<String>,
}

impl TestCorpus {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tests: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Walk `workspace/dir` for `test_*.py` files. Hidden directories and
    /// bytecode caches are skipped.
    pub fn discover(workspace: &Path, dir: &str) -> Result<Self, GateError> {
        let mut tests = BTreeSet::new();
        let root = workspace.join(dir.trim_end_matches('/'));
        walk(&root, dir.trim_end_matches('/'), &mut tests)?;
        debug!(root = %root.display(), count = tests.len(), "discovered tests");
        Ok(Self { tests })
    }

    /// Parse a collector listing, one node id per line. Lines that are not
    /// test ids (headers, summaries) are ignored.
    pub fn from_lines(listing: &str) -> Self {
        let tests = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter(|line| line.contains("::") || line.ends_with(".py"))
            .filter(|line| !line.contains(char::is_whitespace))
            .map(|line| line.replace('\\', "/"))
            .collect();
        Self { tests }
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tests.iter().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tests.contains(id)
    }
}

fn walk(dir: &Path, rel: &str, out: &mut BTreeSet<String>) -> Result<(), GateError> {
    let discovery_err = |source| GateError::Discovery {
        path: dir.display().to_string(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(discovery_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(discovery_err)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "__pycache__" {
            continue;
        }
        let child_rel = format!("{rel}/{name}");
        let file_type = entry.file_type().map_err(discovery_err)?;
        if file_type.is_dir() {
            walk(&entry.path(), &child_rel, out)?;
        } else if name.starts_with("test_") && name.ends_with(".py") {
            out.insert(child_rel);
        }
    }
    Ok(())
}

/// Whether `selector` selects test `id`.
///
/// A selector ending in `/` selects everything below it; any other selector
/// selects the file or node it names and the nodes inside it.
pub fn selects(selector: &str, id: &str) -> bool {
    if selector.ends_with('/') {
        return id.starts_with(selector);
    }
    id == selector
        || id
            .strip_prefix(selector)
            .map(|rest| rest.starts_with("::") || rest.starts_with('/'))
            .unwrap_or(false)
}

/// The directory holding an integration path, when it lies strictly below
/// one of the general roots.
fn integration_group(path: &str, roots: &[String]) -> Option<String> {
    let dir = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path.rsplit_once('/')?.0)
    };
    roots
        .iter()
        .any(|root| selects(root, &dir) && root.trim_end_matches('/') != dir.trim_end_matches('/'))
        .then_some(dir)
}

/// One category resolved against a corpus and a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub kind: CategoryKind,
    /// Paths handed to the test tool.
    pub paths: Vec<String>,
    /// Paths excluded by filter (the general category only).
    pub ignores: Vec<String>,
    /// Tests deliberately not run on this target.
    pub deselected: Vec<Exclusion>,
    /// Tests this category runs.
    pub tests: Vec<String>,
    pub workers: u32,
    pub isolation: Isolation,
}

impl CategoryAssignment {
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }
}

/// Ordered category assignments for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub target: ExecutionTarget,
    pub assignments: Vec<CategoryAssignment>,
}

impl Partition {
    pub fn assignment(&self, kind: CategoryKind) -> Option<&CategoryAssignment> {
        self.assignments.iter().find(|a| a.kind == kind)
    }

    pub fn total_tests(&self) -> usize {
        self.assignments.iter().map(|a| a.tests.len()).sum()
    }

    pub fn exclusions(&self) -> impl Iterator<Item = &Exclusion> {
        self.assignments.iter().flat_map(|a| a.deselected.iter())
    }

    /// Every corpus test is run by exactly one category or deselected by
    /// exactly one exclusion.
    pub fn check_complete(&self, corpus: &TestCorpus) -> Result<(), PartitionError> {
        for id in corpus.iter() {
            let owners: Vec<String> = self
                .assignments
                .iter()
                .filter(|a| {
                    a.tests.iter().any(|t| t == id) || a.deselected.iter().any(|e| e.test == id)
                })
                .map(|a| a.label().to_string())
                .collect();
            match owners.len() {
                0 => return Err(PartitionError::Uncovered { test: id.to_string() }),
                1 => {}
                _ => {
                    return Err(PartitionError::Overlap {
                        test: id.to_string(),
                        categories: owners,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Classifies a corpus into the configured categories.
pub struct SuitePartitioner<'a> {
    config: &'a PipelineConfig,
}

impl<'a> SuitePartitioner<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    pub fn partition(
        &self,
        target: ExecutionTarget,
        corpus: &TestCorpus,
    ) -> Result<Partition, PartitionError> {
        let categories = &self.config.categories;
        let general = self
            .config
            .category(CategoryKind::General)
            .ok_or(PartitionError::MissingGeneral)?;

        let exclusions: Vec<&Exclusion> = if target == ExecutionTarget::Container {
            self.config.container.exclusions.iter().collect()
        } else {
            Vec::new()
        };

        let mut assignments: Vec<CategoryAssignment> = categories
            .iter()
            .map(|cat| CategoryAssignment {
                kind: cat.kind,
                paths: cat.paths.clone(),
                ignores: Vec::new(),
                deselected: exclusions
                    .iter()
                    .filter(|e| e.category == cat.kind)
                    .map(|e| (*e).clone())
                    .collect(),
                tests: Vec::new(),
                workers: cat.workers.for_target(target),
                isolation: cat.isolation,
            })
            .collect();

        let general_idx = assignments
            .iter()
            .position(|a| a.kind == CategoryKind::General)
            .ok_or(PartitionError::MissingGeneral)?;
        // Integration tests live in groups the general category never
        // collects, so none of them can run before the cache flush.
        let mut groups: Vec<String> = Vec::new();
        let mut ignores: Vec<String> = Vec::new();
        for cat in categories.iter().filter(|c| c.kind != CategoryKind::General) {
            for path in &cat.paths {
                if !general.paths.iter().any(|root| selects(root, path)) {
                    continue;
                }
                let group = match cat.kind.phase() {
                    Phase::Integration => integration_group(path, &general.paths),
                    Phase::Unit => None,
                };
                if let Some(group) = &group {
                    if !groups.contains(group) {
                        groups.push(group.clone());
                    }
                }
                let ignore = group.unwrap_or_else(|| path.clone());
                if !ignores.contains(&ignore) {
                    ignores.push(ignore);
                }
            }
        }
        assignments[general_idx].ignores = ignores;

        for id in corpus.iter() {
            if exclusions.iter().any(|e| e.test == id) {
                continue;
            }
            let owners: Vec<usize> = categories
                .iter()
                .enumerate()
                .filter(|(_, c)| c.kind != CategoryKind::General)
                .filter(|(_, c)| c.paths.iter().any(|p| selects(p, id)))
                .map(|(i, _)| i)
                .collect();

            let idx = match owners.as_slice() {
                [only] => *only,
                [] if groups.iter().any(|g| selects(g, id)) => {
                    return Err(PartitionError::UnclaimedIntegration {
                        test: id.to_string(),
                        group: groups
                            .iter()
                            .find(|g| selects(g, id))
                            .cloned()
                            .unwrap_or_default(),
                    })
                }
                [] if general.paths.is_empty()
                    || general.paths.iter().any(|root| selects(root, id)) =>
                {
                    general_idx
                }
                [] => return Err(PartitionError::Uncovered { test: id.to_string() }),
                _ => {
                    return Err(PartitionError::Overlap {
                        test: id.to_string(),
                        categories: owners
                            .iter()
                            .map(|i| categories[*i].kind.label().to_string())
                            .collect(),
                    })
                }
            };
            assignments[idx].tests.push(id.to_string());
        }

        let partition = Partition {
            target,
            assignments,
        };
        partition.check_complete(corpus)?;
        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryConfig;

    fn corpus() -> TestCorpus {
        TestCorpus::new([
            "tests/test_profiler.py::test_a",
            "tests/test_profiler.py::test_b",
            "tests/test_database.py::test_put",
            "tests/test_daemon.py::test_blocking",
            "tests/test_daemon.py::test_stop",
            "tests/integration_tests/test_dataset.py::test_pcap",
            "tests/integration_tests/test_config_files.py::test_yaml",
        ])
    }

    #[test]
    fn selector_matching() {
        assert!(selects("tests/", "tests/test_x.py::test_a"));
        assert!(selects("tests/test_x.py", "tests/test_x.py"));
        assert!(selects("tests/test_x.py", "tests/test_x.py::test_a"));
        assert!(!selects("tests/test_x.py", "tests/test_x.py.bak"));
        assert!(selects("tests/integration_tests", "tests/integration_tests/test_y.py"));
        assert!(!selects("tests/integration", "tests/integration_tests/test_y.py"));
    }

    #[test]
    fn canonical_partition_on_bare_metal() {
        let config = PipelineConfig::default();
        let p = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::BareMetal, &corpus())
            .unwrap();

        let labels: Vec<&str> = p.assignments.iter().map(|a| a.label()).collect();
        assert_eq!(
            labels,
            vec!["general", "storage", "daemon", "dataset_integration", "config_integration"]
        );
        assert_eq!(p.assignment(CategoryKind::General).unwrap().test_count(), 2);
        assert_eq!(p.assignment(CategoryKind::Daemon).unwrap().test_count(), 2);
        assert_eq!(p.assignment(CategoryKind::DatasetIntegration).unwrap().workers, 3);
        assert_eq!(p.total_tests(), corpus().len());
    }

    #[test]
    fn general_ignores_every_other_category() {
        let config = PipelineConfig::default();
        let p = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::BareMetal, &corpus())
            .unwrap();
        let general = p.assignment(CategoryKind::General).unwrap();
        assert_eq!(
            general.ignores,
            vec![
                "tests/test_database.py".to_string(),
                "tests/test_daemon.py".to_string(),
                "tests/integration_tests/".to_string(),
            ]
        );
    }

    #[test]
    fn unclaimed_integration_test_is_rejected() {
        let config = PipelineConfig::default();
        let mut ids: Vec<String> = corpus().iter().map(str::to_string).collect();
        ids.push("tests/integration_tests/test_portscans.py::test_vertical".into());
        let err = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::BareMetal, &TestCorpus::new(ids))
            .unwrap_err();
        assert_eq!(
            err,
            PartitionError::UnclaimedIntegration {
                test: "tests/integration_tests/test_portscans.py::test_vertical".into(),
                group: "tests/integration_tests/".into(),
            }
        );
    }

    #[test]
    fn integration_group_must_sit_below_the_root() {
        let roots = vec!["tests/".to_string()];
        assert_eq!(
            integration_group("tests/integration_tests/test_dataset.py", &roots).as_deref(),
            Some("tests/integration_tests/")
        );
        assert_eq!(integration_group("tests/test_dataset.py", &roots), None);
        assert_eq!(integration_group("other/test_dataset.py", &roots), None);
    }

    #[test]
    fn container_deselects_network_blocking_test() {
        let config = PipelineConfig::default();
        let p = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::Container, &corpus())
            .unwrap();

        let daemon = p.assignment(CategoryKind::Daemon).unwrap();
        assert_eq!(daemon.tests, vec!["tests/test_daemon.py::test_stop"]);
        assert_eq!(daemon.deselected.len(), 1);
        assert_eq!(p.assignment(CategoryKind::DatasetIntegration).unwrap().workers, 4);
        assert_eq!(p.total_tests() + p.exclusions().count(), corpus().len());
    }

    #[test]
    fn overlapping_categories_are_rejected() {
        let mut config = PipelineConfig::default();
        config.categories[1].paths.push("tests/test_daemon.py".into());
        let err = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::BareMetal, &corpus())
            .unwrap_err();
        assert!(matches!(err, PartitionError::Overlap { .. }));
    }

    #[test]
    fn test_outside_general_root_is_uncovered() {
        let config = PipelineConfig::default();
        let corpus = TestCorpus::new(["modules/test_stray.py"]);
        let err = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::BareMetal, &corpus)
            .unwrap_err();
        assert_eq!(
            err,
            PartitionError::Uncovered {
                test: "modules/test_stray.py".into()
            }
        );
    }

    #[test]
    fn missing_general_is_rejected() {
        let mut config = PipelineConfig::default();
        config.categories = CategoryConfig::canonical().into_iter().skip(1).collect();
        let err = SuitePartitioner::new(&config)
            .partition(ExecutionTarget::BareMetal, &corpus())
            .unwrap_err();
        assert_eq!(err, PartitionError::MissingGeneral);
    }

    #[test]
    fn from_lines_skips_collector_noise() {
        let listing = "\
tests/test_a.py::test_one
tests/test_a.py::test_two

# comment
3 tests collected in 0.12s
tests/test_b.py
";
        let corpus = TestCorpus::from_lines(listing);
        assert_eq!(corpus.len(), 3);
        assert!(corpus.contains("tests/test_b.py"));
    }

    #[test]
    fn discover_walks_test_files() {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join("tests");
        std::fs::create_dir_all(tests.join("integration_tests")).unwrap();
        std::fs::create_dir_all(tests.join("__pycache__")).unwrap();
        std::fs::create_dir_all(tests.join(".hidden")).unwrap();
        std::fs::write(tests.join("test_a.py"), "").unwrap();
        std::fs::write(tests.join("helper.py"), "").unwrap();
        std::fs::write(tests.join("integration_tests/test_dataset.py"), "").unwrap();
        std::fs::write(tests.join("__pycache__/test_a.py"), "").unwrap();
        std::fs::write(tests.join(".hidden/test_h.py"), "").unwrap();

        let corpus = TestCorpus::discover(dir.path(), "tests/").unwrap();
        let ids: Vec<&str> = corpus.iter().collect();
        assert_eq!(
            ids,
            vec!["tests/integration_tests/test_dataset.py", "tests/test_a.py"]
        );
    }

    #[test]
    fn discover_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TestCorpus::discover(dir.path(), "tests").unwrap_err();
        assert!(matches!(err, GateError::Discovery { .. }));
    }
}
