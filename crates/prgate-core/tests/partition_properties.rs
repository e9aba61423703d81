//! Partition properties over generated corpora.

use std::collections::HashMap;

use prgate_core::partition::selects;
use prgate_core::{CategoryKind, PipelineConfig, SuitePartitioner, TestCorpus};
use prgate_env::ExecutionTarget;

const FILES: &[&str] = &[
    "tests/test_profiler.py",
    "tests/test_flowalerts.py",
    "tests/test_database.py",
    "tests/test_daemon.py",
    "tests/test_inputProc.py",
    "tests/module_tests/test_arp.py",
    "tests/integration_tests/test_dataset.py",
    "tests/integration_tests/test_config_files.py",
    "tests/module_tests/test_http_analyzer.py",
];

/// Small deterministic generator so failures are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn generated_corpus(seed: u64) -> TestCorpus {
    let mut rng = Lcg(seed);
    let mut ids = Vec::new();
    for file in FILES {
        let cases = rng.next() % 12;
        if cases == 0 {
            // Some corpora list bare files, as discovery does.
            ids.push(file.to_string());
        }
        for case in 0..cases {
            ids.push(format!("{file}::test_{case}"));
        }
    }
    if seed % 3 == 0 {
        ids.push("tests/test_daemon.py::test_blocking".to_string());
    }
    TestCorpus::new(ids)
}

#[test]
fn partition_is_complete_and_disjoint() {
    let config = PipelineConfig::default();
    let partitioner = SuitePartitioner::new(&config);

    for seed in 0..200 {
        let corpus = generated_corpus(seed);
        for target in ExecutionTarget::ALL {
            let partition = partitioner
                .partition(target, &corpus)
                .unwrap_or_else(|e| panic!("seed {seed} on {target}: {e}"));

            let mut owners: HashMap<&str, usize> = HashMap::new();
            for assignment in &partition.assignments {
                for test in &assignment.tests {
                    *owners.entry(test.as_str()).or_default() += 1;
                }
            }
            for exclusion in partition.exclusions() {
                if corpus.contains(&exclusion.test) {
                    *owners.entry(exclusion.test.as_str()).or_default() += 1;
                }
            }

            for id in corpus.iter() {
                assert_eq!(
                    owners.get(id).copied(),
                    Some(1),
                    "seed {seed} on {target}: {id} owned {:?} times",
                    owners.get(id)
                );
            }
            assert_eq!(owners.len(), corpus.len());
        }
    }
}

#[test]
fn general_filters_out_every_other_category() {
    let config = PipelineConfig::default();
    let partitioner = SuitePartitioner::new(&config);

    for seed in 0..50 {
        let corpus = generated_corpus(seed);
        let partition = partitioner
            .partition(ExecutionTarget::BareMetal, &corpus)
            .expect("partition");
        let general = partition.assignment(CategoryKind::General).expect("general");

        for assignment in partition
            .assignments
            .iter()
            .filter(|a| a.kind != CategoryKind::General)
        {
            for test in &assignment.tests {
                assert!(
                    general.ignores.iter().any(|i| selects(i, test)),
                    "{test} would also be collected by the general category"
                );
            }
        }
        for test in &general.tests {
            assert!(!general.ignores.iter().any(|i| selects(i, test)));
        }
    }
}

#[test]
fn exclusions_apply_to_container_only() {
    let config = PipelineConfig::default();
    let partitioner = SuitePartitioner::new(&config);
    let corpus = generated_corpus(3);
    assert!(corpus.contains("tests/test_daemon.py::test_blocking"));

    let bare = partitioner
        .partition(ExecutionTarget::BareMetal, &corpus)
        .expect("bare metal");
    let container = partitioner
        .partition(ExecutionTarget::Container, &corpus)
        .expect("container");

    let daemon_bare = bare.assignment(CategoryKind::Daemon).expect("daemon");
    let daemon_container = container.assignment(CategoryKind::Daemon).expect("daemon");
    assert!(daemon_bare
        .tests
        .contains(&"tests/test_daemon.py::test_blocking".to_string()));
    assert!(!daemon_container
        .tests
        .contains(&"tests/test_daemon.py::test_blocking".to_string()));
    assert_eq!(daemon_bare.tests.len(), daemon_container.tests.len() + 1);
}

#[test]
fn partition_is_stable_across_calls() {
    let config = PipelineConfig::default();
    let partitioner = SuitePartitioner::new(&config);
    let corpus = generated_corpus(42);
    for target in ExecutionTarget::ALL {
        assert_eq!(
            partitioner.partition(target, &corpus).expect("first"),
            partitioner.partition(target, &corpus).expect("second")
        );
    }
}

#[test]
fn integration_tests_never_run_in_general() {
    let config = PipelineConfig::default();
    let partitioner = SuitePartitioner::new(&config);

    for seed in 0..50 {
        let corpus = generated_corpus(seed);
        for target in ExecutionTarget::ALL {
            let partition = partitioner.partition(target, &corpus).expect("partition");
            let general = partition.assignment(CategoryKind::General).expect("general");
            assert!(general
                .tests
                .iter()
                .all(|t| !t.starts_with("tests/integration_tests/")));
            assert!(general
                .ignores
                .contains(&"tests/integration_tests/".to_string()));
        }
    }

    let mut ids: Vec<String> = generated_corpus(7).iter().map(str::to_string).collect();
    ids.push("tests/integration_tests/test_portscans.py".to_string());
    assert!(partitioner
        .partition(ExecutionTarget::BareMetal, &TestCorpus::new(ids))
        .is_err());
}
