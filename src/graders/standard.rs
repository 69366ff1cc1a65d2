use super::checkers::{self, Checker};
use super::{AbortHandle, Grader};
use crate::config::types::Result;
use crate::exec::{LaunchLimits, ProcessOutcome};
use crate::executors::Executor;
use crate::problem::{Problem, TestCase};
use crate::verdict::{CaseLimits, ResultFlags, TestResult, VerdictClassifier};
use log::{debug, warn};
use std::sync::Arc;

/// Feeds the case input on stdin and compares stdout with the expected output
pub struct StandardGrader {
    problem: Arc<Problem>,
    executor: Box<dyn Executor>,
    checker: Checker,
    abort: AbortHandle,
}

impl StandardGrader {
    pub fn new(problem: Arc<Problem>, executor: Box<dyn Executor>, abort: AbortHandle) -> Result<Self> {
        let checker = checkers::by_name(&problem.config.checker)?;
        problem.install_symlinks(executor.working_dir())?;
        Ok(Self {
            problem,
            executor,
            checker,
            abort,
        })
    }

    fn limits(&self) -> LaunchLimits {
        let time = self.problem.time_limit;
        let mut limits = self
            .executor
            .launch_limits(time, self.problem.memory_limit)
            .with_time(time, time * self.problem.config.wall_time_factor);
        limits.stdout_limit = self.problem.config.output_limit_length;
        limits.kill_on_output_limit = true;
        limits
    }

    fn run(&self, input: Vec<u8>) -> Result<ProcessOutcome> {
        let policy = self.executor.security(None);
        let process = self.executor.launch(&[], &self.limits(), policy, input)?;
        self.abort.track(process.killer());
        let outcome = process.wait();
        self.abort.untrack();
        outcome
    }

    fn expected_output(&self, case: &TestCase) -> Result<Vec<u8>> {
        match &case.output {
            Some(name) => self.problem.data.read(name),
            None => Ok(Vec::new()),
        }
    }
}

/// Text input gets its line endings normalised
fn prepare_input(data: Vec<u8>, binary: bool) -> Vec<u8> {
    if binary || !data.contains(&b'\r') {
        return data;
    }
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        if byte == b'\r' && bytes.peek() == Some(&b'\n') {
            continue;
        }
        out.push(byte);
    }
    out
}

impl Grader for StandardGrader {
    fn grade(&mut self, case: &TestCase) -> Result<TestResult> {
        let mut result = TestResult::new(case);
        result.runtime_version = self.executor.runtime_version();

        let input = match &case.input {
            Some(name) => self.problem.data.read(name)?,
            None => Vec::new(),
        };
        let binary = case.has_binary_data || self.problem.config.binary_data;
        let input = prepare_input(input, binary);

        let outcome = match self.run(input) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("case {} of {} failed to launch: {}", case.position, self.problem.id, e);
                result.result_flag = ResultFlags::IE;
                result.feedback = e.to_string();
                return Ok(result);
            }
        };

        result.execution_time = outcome.cpu_time;
        result.wall_clock_time = outcome.wall_time;
        result.max_memory = outcome.max_memory;
        result.context_switches = outcome.context_switches;

        let limits = CaseLimits {
            time: self.problem.time_limit,
            memory: self.problem.memory_limit,
        };
        let classification = VerdictClassifier::classify(&outcome, &limits);
        result.result_flag = classification.flags;
        result.feedback = classification.feedback;
        if !outcome.stderr.is_empty() {
            result.extended_feedback = String::from_utf8_lossy(&outcome.stderr).into_owned();
        }

        if result.result_flag.is_empty() {
            let expected = self.expected_output(case)?;
            let output = prepare_input(outcome.stdout.clone(), binary);
            if !(self.checker)(&output, &expected) {
                result.result_flag = ResultFlags::WA;
            }
        }

        if result.is_accepted() {
            result.points = case.points as f64;
        }
        let keep = case.output_prefix_length.min(outcome.stdout.len());
        result.proc_output = outcome.stdout[..keep].to_vec();

        debug!(
            "case {} of {}: {} in {:.3}s, {} KB",
            case.position,
            self.problem.id,
            result.readable_codes().join(" "),
            result.execution_time,
            result.max_memory
        );
        Ok(result)
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}
