use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_grader() -> String {
    "standard".to_string()
}

fn default_checker() -> String {
    "standard".to_string()
}

/// Contents of a problem's `init.yml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProblemConfig {
    /// Archives are recognised only to report them as unsupported
    pub archive: Option<String>,
    pub grader: String,
    pub grader_config: BTreeMap<String, serde_yaml::Value>,
    pub checker: String,
    pub unbuffered: bool,
    pub pretest_test_cases: Option<Vec<CaseConfig>>,
    pub test_cases: Option<Vec<CaseConfig>>,
    pub hints: Vec<String>,
    pub wall_time_factor: f64,
    pub output_prefix_length: usize,
    pub output_limit_length: usize,
    pub binary_data: bool,
    pub short_circuit: bool,
    pub points: u32,
    /// Link name inside the working directory to a file in the problem directory
    pub symlinks: BTreeMap<String, String>,
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            archive: None,
            grader: default_grader(),
            grader_config: BTreeMap::new(),
            checker: default_checker(),
            unbuffered: false,
            pretest_test_cases: None,
            test_cases: None,
            hints: Vec::new(),
            wall_time_factor: 3.0,
            output_prefix_length: 0,
            output_limit_length: 25_165_824,
            binary_data: false,
            short_circuit: true,
            points: 1,
            symlinks: BTreeMap::new(),
            meta: BTreeMap::new(),
        }
    }
}

/// One entry of `test_cases`; either a plain case or a `batched` group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaseConfig {
    #[serde(rename = "in")]
    pub input: Option<String>,
    #[serde(rename = "out")]
    pub output: Option<String>,
    pub points: Option<u32>,
    pub output_prefix_length: Option<usize>,
    pub has_binary_data: bool,
    pub batched: Option<Vec<CaseConfig>>,
    /// Kept signed so that bad values reach validation instead of failing the parse
    pub dependencies: Vec<i64>,
}

/// A single runnable case, identified by `(problem_id, position)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub problem_id: String,
    pub position: usize,
    /// Enclosing batch number, 0 outside any batch
    pub batch: usize,
    pub input: Option<String>,
    pub output: Option<String>,
    pub points: u32,
    pub output_prefix_length: usize,
    pub has_binary_data: bool,
}

/// Cases sharing one point budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedTestCase {
    /// Counted from 1
    pub batch: usize,
    pub points: u32,
    /// Earlier batch numbers that must pass first
    pub dependencies: Vec<usize>,
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaseEntry {
    Single(TestCase),
    Batch(BatchedTestCase),
}

impl CaseEntry {
    /// Every runnable case in this entry
    pub fn cases(&self) -> &[TestCase] {
        match self {
            CaseEntry::Single(case) => std::slice::from_ref(case),
            CaseEntry::Batch(batch) => &batch.cases,
        }
    }
}
