//! Integration tests for problem discovery and loading
//!
//! Each test lays out a throwaway problem tree and goes through
//! `ProblemStore` the way the worker does.

use judgebox::problem::{CaseEntry, ProblemStore, SubmissionMeta};
use judgebox::JudgeError;
use std::path::Path;
use tempfile::TempDir;

fn problem_tree(init: &str) -> (TempDir, ProblemStore) {
    let dir = TempDir::new().unwrap();
    let problem = dir.path().join("sum-ab");
    std::fs::create_dir(&problem).unwrap();
    std::fs::write(problem.join("init.yml"), init).unwrap();
    for name in ["1.in", "1.out", "2.in", "2.out", "3.in", "3.out"] {
        std::fs::write(problem.join(name), "1 2\n").unwrap();
    }
    let store = ProblemStore::discover(&[format!("{}/*", dir.path().display())]).unwrap();
    (dir, store)
}

fn load(store: &ProblemStore) -> judgebox::Result<judgebox::problem::Problem> {
    store.load("sum-ab", 2.0, 65536, SubmissionMeta::new())
}

#[test]
fn test_positions_and_batches_are_numbered() {
    let (_dir, store) = problem_tree(concat!(
        "test_cases:\n",
        "- {in: 1.in, out: 1.out, points: 5}\n",
        "- batched:\n",
        "  - {in: 2.in, out: 2.out}\n",
        "  - {in: 3.in, out: 3.out}\n",
        "  points: 10\n",
    ));
    let problem = load(&store).unwrap();

    assert_eq!(problem.cases().len(), 2);
    assert_eq!(problem.case(0).unwrap().batch, 0);
    assert_eq!(problem.case(2).unwrap().batch, 1);
    assert!(problem.case(3).is_none());
    assert_eq!(problem.total_points(), 15);
    let CaseEntry::Batch(batch) = &problem.cases()[1] else {
        panic!("second entry should be a batch");
    };
    assert_eq!(batch.batch, 1);
    assert_eq!(batch.cases.len(), 2);
}

#[test]
fn test_forward_dependency_is_an_init_error() {
    let (_dir, store) = problem_tree(concat!(
        "test_cases:\n",
        "- batched: [{in: 1.in, out: 1.out}]\n",
        "  points: 1\n",
        "  dependencies: [1]\n",
    ));
    assert!(matches!(load(&store), Err(JudgeError::InvalidInit(_))));
}

#[test]
fn test_non_positive_dependency_is_an_init_error() {
    for dependency in ["0", "-1"] {
        let (_dir, store) = problem_tree(&format!(
            concat!(
                "test_cases:\n",
                "- batched: [{{in: 1.in, out: 1.out}}]\n",
                "  points: 1\n",
                "- batched: [{{in: 2.in, out: 2.out}}]\n",
                "  points: 1\n",
                "  dependencies: [{}]\n",
            ),
            dependency
        ));
        assert!(matches!(load(&store), Err(JudgeError::InvalidInit(_))), "dependency {}", dependency);
    }
}

#[test]
fn test_nested_batch_is_an_init_error() {
    let (_dir, store) = problem_tree(concat!(
        "test_cases:\n",
        "- batched:\n",
        "  - batched: [{in: 1.in, out: 1.out}]\n",
        "  points: 1\n",
    ));
    assert!(matches!(load(&store), Err(JudgeError::InvalidInit(_))));
}

#[test]
fn test_empty_or_missing_cases_are_init_errors() {
    let (_dir, store) = problem_tree("test_cases: []\n");
    assert!(matches!(load(&store), Err(JudgeError::InvalidInit(_))));

    let (_dir, store) = problem_tree("");
    assert!(matches!(load(&store), Err(JudgeError::InvalidInit(_))));
}

#[test]
fn test_archives_are_reported_as_unsupported() {
    let (_dir, store) = problem_tree("archive: data.zip\ntest_cases: [{in: 1.in, out: 1.out}]\n");
    assert!(matches!(load(&store), Err(JudgeError::InvalidInit(_))));
}

#[test]
fn test_unknown_problem_is_an_init_error() {
    let (_dir, store) = problem_tree("test_cases: [{in: 1.in, out: 1.out}]\n");
    let result = store.load("missing", 1.0, 1024, SubmissionMeta::new());
    assert!(matches!(result, Err(JudgeError::InvalidInit(_))));
}

#[test]
fn test_pretests_only_grades_pretests() {
    let (_dir, store) = problem_tree(concat!(
        "pretest_test_cases: [{in: 1.in, out: 1.out}]\n",
        "test_cases: [{in: 2.in, out: 2.out}, {in: 3.in, out: 3.out}]\n",
    ));
    let mut meta = SubmissionMeta::new();
    meta.insert("pretests_only".to_string(), serde_json::Value::Bool(true));
    let problem = store.load("sum-ab", 2.0, 65536, meta).unwrap();
    assert!(problem.pretested());
    assert_eq!(problem.cases().len(), 1);

    let problem = load(&store).unwrap();
    assert!(!problem.pretested());
    assert_eq!(problem.cases().len(), 3);
}

#[test]
fn test_case_data_is_read_from_the_problem_directory() {
    let (_dir, store) = problem_tree("test_cases: [{in: 1.in, out: 1.out}]\n");
    let problem = load(&store).unwrap();
    assert_eq!(problem.data.read("1.in").unwrap(), b"1 2\n");
    assert!(matches!(problem.data.read("nope.in"), Err(JudgeError::InvalidInit(_))));
    assert!(Path::new(problem.data.root()).join("init.yml").exists());
}
