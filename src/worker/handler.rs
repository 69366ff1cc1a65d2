//! Worker side: grade one submission and stream progress to the judge.

use super::ipc::{read_message, write_message, GradeRequest, IpcMessage, WorkerRequest};
use crate::config::types::{JudgeError, Result};
use crate::executors::{CompileOutcome, ExecutorRegistry};
use crate::graders::{AbortHandle, Grader, GraderRegistry};
use crate::observability::audit;
use crate::problem::{CaseEntry, Problem, ProblemStore, TestCase};
use crate::verdict::TestResult;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Entry point of `--internal-role worker`
pub fn run_worker_role(ipc_fd: RawFd) -> Result<()> {
    // SAFETY: the judge hands this process exactly one socket on `ipc_fd`
    // and nothing else in the process owns it.
    let stream = unsafe { UnixStream::from_raw_fd(ipc_fd) };
    nix::fcntl::fcntl(
        ipc_fd,
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )?;
    serve(stream)
}

/// Run the whole worker conversation over `stream`:
/// `Hello`, grading messages, then always `Bye`.
pub fn serve(stream: UnixStream) -> Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = stream;
    write_message(&mut writer, &IpcMessage::Hello)?;

    let request = match read_message::<_, WorkerRequest>(&mut reader) {
        Ok(Some(WorkerRequest::Grade(request))) => request,
        Ok(Some(other)) => {
            let message = format!("expected a grade request, got {:?}", other);
            return finish(&mut writer, Err(JudgeError::Ipc(message)));
        }
        Ok(None) => {
            info!("judge closed the channel before sending work");
            return Ok(());
        }
        Err(e) => return finish(&mut writer, Err(e)),
    };
    if let Some(path) = &request.audit_log {
        if let Err(e) = audit::init_audit_file(path) {
            warn!("audit events stay in the log only: {}", e);
        }
    }
    info!(
        "worker grading {}/{} in {}",
        request.submission.problem_id, request.submission.id, request.submission.language
    );

    let abort = AbortHandle::new();
    let receiver = {
        let abort = abort.clone();
        thread::Builder::new()
            .name("abort-receiver".to_string())
            .spawn(move || receive_requests(reader, abort))?
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut emit = |message: IpcMessage| write_message(&mut writer, &message);
        grade_submission(&request, &abort, &mut emit)
    }))
    .unwrap_or_else(|payload| Err(JudgeError::Internal(panic_message(payload.as_ref()))));

    let result = finish(&mut writer, outcome);
    if receiver.join().is_err() {
        warn!("abort receiver panicked");
    }
    result
}

/// Report a fault if there was one, then say goodbye
fn finish(writer: &mut UnixStream, outcome: Result<()>) -> Result<()> {
    if let Err(e) = outcome {
        error!("grading failed: {}", e);
        write_message(
            writer,
            &IpcMessage::UnhandledException {
                message: e.to_string(),
            },
        )?;
    }
    write_message(writer, &IpcMessage::Bye)
}

fn receive_requests(mut reader: UnixStream, abort: AbortHandle) {
    loop {
        match read_message::<_, WorkerRequest>(&mut reader) {
            Ok(Some(WorkerRequest::Abort)) => {
                info!("abort requested");
                abort.abort();
            }
            Ok(Some(WorkerRequest::Close)) => return,
            Ok(Some(WorkerRequest::Grade(_))) => warn!("ignoring a second grade request"),
            Ok(None) => {
                warn!("judge hung up, aborting");
                abort.abort();
                return;
            }
            Err(e) => {
                warn!("judge channel failed ({}), aborting", e);
                abort.abort();
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {}", detail)
}

/// Load, compile and grade; every message goes through `emit`
pub fn grade_submission(
    request: &GradeRequest,
    abort: &AbortHandle,
    emit: &mut dyn FnMut(IpcMessage) -> Result<()>,
) -> Result<()> {
    let submission = &request.submission;
    let store = ProblemStore::discover(&request.problem_storage_globs)?;
    let problem = Arc::new(store.load(
        &submission.problem_id,
        submission.time_limit,
        submission.memory_limit,
        submission.meta.clone(),
    )?);

    let mut executors = ExecutorRegistry::with_builtins(&request.executors, &request.executor)?;
    executors.filter(request.only_executors.as_deref(), request.exclude_executors.as_deref());
    let mut executor = executors.create(
        &submission.language,
        &submission.problem_id,
        submission.source.clone().into_bytes(),
        problem.config.unbuffered,
    )?;

    match executor.prepare() {
        Ok(CompileOutcome::Ready { message: Some(log) }) => emit(IpcMessage::CompileMessage { log })?,
        Ok(CompileOutcome::Ready { message: None }) => {}
        Ok(CompileOutcome::Failed { log }) | Err(JudgeError::Compile(log)) => {
            info!("compile error for {}", submission.id);
            return emit(IpcMessage::CompileError { log });
        }
        Err(e) => return Err(e),
    }
    if abort.is_aborted() {
        return emit(IpcMessage::GradingAborted);
    }

    let graders = GraderRegistry::with_builtins(&request.graders);
    let mut grader = graders.create(&problem.config.grader, problem.clone(), executor, abort.clone())?;
    grade_cases(&problem, grader.as_mut(), submission.short_circuit, emit)
}

/// Why grading stopped early
enum Stop {
    Aborted,
}

/// Walk the case sequence, honouring short-circuiting, batch
/// dependencies and aborts
pub fn grade_cases(
    problem: &Problem,
    grader: &mut dyn Grader,
    short_circuit: bool,
    emit: &mut dyn FnMut(IpcMessage) -> Result<()>,
) -> Result<()> {
    emit(IpcMessage::GradingBegin {
        pretested: problem.pretested(),
    })?;

    let mut walk = CaseWalk {
        grader,
        emit: &mut *emit,
        short_circuit,
        short_circuited: false,
        failed_batches: BTreeSet::new(),
    };
    match walk.run(problem)? {
        Some(Stop::Aborted) => {
            info!("grading of {} aborted", problem.id);
            emit(IpcMessage::GradingAborted)
        }
        None => emit(IpcMessage::GradingEnd),
    }
}

struct CaseWalk<'a, 'e> {
    grader: &'a mut dyn Grader,
    emit: &'e mut dyn FnMut(IpcMessage) -> Result<()>,
    short_circuit: bool,
    /// Set once a failure stops the rest of the submission
    short_circuited: bool,
    failed_batches: BTreeSet<usize>,
}

impl CaseWalk<'_, '_> {
    fn run(&mut self, problem: &Problem) -> Result<Option<Stop>> {
        for entry in problem.cases() {
            let stop = match entry {
                CaseEntry::Single(case) => self.single(case)?,
                CaseEntry::Batch(batch) => {
                    (self.emit)(IpcMessage::BatchBegin { batch: batch.batch })?;
                    let skip = self.short_circuited
                        || batch
                            .dependencies
                            .iter()
                            .any(|dependency| self.failed_batches.contains(dependency));
                    if skip {
                        debug!("skipping batch {}", batch.batch);
                    }

                    let mut failed = skip;
                    for case in &batch.cases {
                        if self.grader.is_aborted() {
                            return Ok(Some(Stop::Aborted));
                        }
                        if skip || (failed && problem.config.short_circuit) {
                            self.report(TestResult::short_circuited(case))?;
                            continue;
                        }
                        match self.run_case(case)? {
                            Some(result) => {
                                failed |= !result.is_accepted();
                                self.report(result)?;
                            }
                            None => return Ok(Some(Stop::Aborted)),
                        }
                    }

                    (self.emit)(IpcMessage::BatchEnd { batch: batch.batch })?;
                    if failed {
                        self.failed_batches.insert(batch.batch);
                        self.short_circuited |= self.short_circuit;
                    }
                    None
                }
            };
            if stop.is_some() {
                return Ok(stop);
            }
        }
        Ok(None)
    }

    fn single(&mut self, case: &TestCase) -> Result<Option<Stop>> {
        if self.grader.is_aborted() {
            return Ok(Some(Stop::Aborted));
        }
        if self.short_circuited {
            self.report(TestResult::short_circuited(case))?;
            return Ok(None);
        }
        match self.run_case(case)? {
            Some(result) => {
                if !result.is_accepted() && self.short_circuit {
                    self.short_circuited = true;
                }
                self.report(result)?;
                Ok(None)
            }
            None => Ok(Some(Stop::Aborted)),
        }
    }

    /// `None` when an abort arrived while the case ran
    fn run_case(&mut self, case: &TestCase) -> Result<Option<TestResult>> {
        let result = self.grader.grade(case)?;
        if self.grader.is_aborted() {
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn report(&mut self, result: TestResult) -> Result<()> {
        (self.emit)(IpcMessage::Result {
            result: Box::new(result),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{ProblemConfig, ProblemData, SubmissionMeta};
    use crate::verdict::ResultFlags;

    /// Fails the listed positions, aborts after grading `abort_at`
    struct ScriptedGrader {
        failing: BTreeSet<usize>,
        abort_at: Option<usize>,
        graded: Vec<usize>,
        abort: AbortHandle,
    }

    impl ScriptedGrader {
        fn new(failing: &[usize]) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                abort_at: None,
                graded: Vec::new(),
                abort: AbortHandle::new(),
            }
        }
    }

    impl Grader for ScriptedGrader {
        fn grade(&mut self, case: &TestCase) -> Result<TestResult> {
            self.graded.push(case.position);
            if self.abort_at == Some(case.position) {
                self.abort.abort();
            }
            let mut result = TestResult::new(case);
            if self.failing.contains(&case.position) {
                result.result_flag = ResultFlags::WA;
            } else {
                result.points = result.total_points;
            }
            Ok(result)
        }

        fn abort_handle(&self) -> AbortHandle {
            self.abort.clone()
        }
    }

    fn problem(yaml: &str) -> Problem {
        let config: ProblemConfig = serde_yaml::from_str(yaml).unwrap();
        Problem::new("sum-ab", 1.0, 65536, SubmissionMeta::new(), config, ProblemData::new("/nonexistent")).unwrap()
    }

    fn run(problem: &Problem, grader: &mut ScriptedGrader, short_circuit: bool) -> Vec<IpcMessage> {
        let mut messages = Vec::new();
        let mut emit = |message: IpcMessage| {
            messages.push(message);
            Ok(())
        };
        grade_cases(problem, grader, short_circuit, &mut emit).unwrap();
        messages
    }

    fn results(messages: &[IpcMessage]) -> Vec<(usize, ResultFlags)> {
        messages
            .iter()
            .filter_map(|message| match message {
                IpcMessage::Result { result } => Some((result.position, result.result_flag)),
                _ => None,
            })
            .collect()
    }

    const FLAT: &str = "test_cases: [{in: a}, {in: b}, {in: c}]";
    const BATCHED: &str = "test_cases:\n  - batched: [{in: a}, {in: b}]\n    points: 5\n  - batched: [{in: c}]\n    points: 5\n    dependencies: [1]\n  - {in: d}\n";

    #[test]
    fn test_flat_run_is_bracketed() {
        let problem = problem(FLAT);
        let messages = run(&problem, &mut ScriptedGrader::new(&[]), false);
        assert_eq!(messages.first(), Some(&IpcMessage::GradingBegin { pretested: false }));
        assert_eq!(messages.last(), Some(&IpcMessage::GradingEnd));
        assert_eq!(results(&messages).len(), 3);
    }

    #[test]
    fn test_short_circuit_skips_the_rest() {
        let problem = problem(FLAT);
        let mut grader = ScriptedGrader::new(&[0]);
        let messages = run(&problem, &mut grader, true);
        assert_eq!(grader.graded, vec![0]);
        assert_eq!(
            results(&messages),
            vec![(0, ResultFlags::WA), (1, ResultFlags::SC), (2, ResultFlags::SC)]
        );
    }

    #[test]
    fn test_without_short_circuit_everything_runs() {
        let problem = problem(FLAT);
        let mut grader = ScriptedGrader::new(&[0]);
        run(&problem, &mut grader, false);
        assert_eq!(grader.graded, vec![0, 1, 2]);
    }

    #[test]
    fn test_batch_failure_skips_rest_of_batch_and_dependents() {
        let problem = problem(BATCHED);
        let mut grader = ScriptedGrader::new(&[0]);
        let messages = run(&problem, &mut grader, false);
        assert_eq!(grader.graded, vec![0, 3]);
        assert_eq!(
            results(&messages),
            vec![
                (0, ResultFlags::WA),
                (1, ResultFlags::SC),
                (2, ResultFlags::SC),
                (3, ResultFlags::AC)
            ]
        );
        assert!(messages.contains(&IpcMessage::BatchBegin { batch: 2 }));
        assert!(messages.contains(&IpcMessage::BatchEnd { batch: 2 }));
    }

    #[test]
    fn test_in_batch_short_circuit_can_be_disabled() {
        let problem = problem(&format!("{}short_circuit: false\n", BATCHED));
        let mut grader = ScriptedGrader::new(&[0]);
        run(&problem, &mut grader, false);
        assert_eq!(grader.graded, vec![0, 1, 3]);
    }

    #[test]
    fn test_abort_during_case_stops_grading() {
        let problem = problem(FLAT);
        let mut grader = ScriptedGrader::new(&[]);
        grader.abort_at = Some(1);
        let messages = run(&problem, &mut grader, false);
        assert_eq!(grader.graded, vec![0, 1]);
        assert_eq!(results(&messages), vec![(0, ResultFlags::AC)]);
        assert_eq!(messages.last(), Some(&IpcMessage::GradingAborted));
    }
}
