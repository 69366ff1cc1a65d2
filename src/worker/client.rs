//! Judge side of a worker: start it, read its messages, abort it.

use super::ipc::{is_timeout, read_message, write_message, GradeRequest, IpcMessage, WorkerRequest};
use super::spawn::{WorkerProcessHandle, WorkerSpawner};
use crate::config::types::{JudgeError, Result};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reads one message against a single deadline, however the peer splits it
struct DeadlineReader<'a> {
    stream: &'a mut UnixStream,
    deadline: Instant,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(ErrorKind::TimedOut, "message deadline passed"));
        }
        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.read(buf)
    }
}

/// Sends abort requests to a worker from any thread
#[derive(Debug, Clone)]
pub struct WorkerAborter {
    submission_id: u64,
    writer: Arc<Mutex<UnixStream>>,
}

impl WorkerAborter {
    /// Best-effort; a worker that already finished is not an error
    pub fn request_abort_grading(&self) {
        let mut writer = self.writer.lock();
        match write_message(&mut *writer, &WorkerRequest::Abort) {
            Ok(()) => debug!("abort sent to worker of {}", self.submission_id),
            Err(e) => warn!(
                "failed to send abort to worker of {} ({}), did it race?",
                self.submission_id, e
            ),
        }
    }

    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }
}

/// A running worker, owned by the grading supervisor
pub struct JudgeWorker {
    submission_id: u64,
    receive_timeout: Duration,
    reader: UnixStream,
    writer: Arc<Mutex<UnixStream>>,
    process: Box<dyn WorkerProcessHandle>,
    finished: bool,
}

impl JudgeWorker {
    /// Spawn a worker and hand it `request`; the receive timeout defaults to
    /// `max(60, 2 * time_limit)` seconds
    pub fn start(spawner: &dyn WorkerSpawner, request: GradeRequest) -> Result<(Self, WorkerAborter)> {
        let timeout = Duration::from_secs(request.submission.receive_timeout());
        Self::start_with_timeout(spawner, request, timeout)
    }

    pub fn start_with_timeout(
        spawner: &dyn WorkerSpawner,
        request: GradeRequest,
        receive_timeout: Duration,
    ) -> Result<(Self, WorkerAborter)> {
        let submission_id = request.submission.id;
        let label = format!("{}/{}", request.submission.problem_id, submission_id);
        let spawned = spawner.spawn(&label)?;

        let reader = spawned.channel;
        let mut writer = reader.try_clone()?;
        let mut process = spawned.process;
        if let Err(e) = write_message(&mut writer, &WorkerRequest::Grade(Box::new(request))) {
            let _ = process.kill();
            return Err(e);
        }

        let writer = Arc::new(Mutex::new(writer));
        let aborter = WorkerAborter {
            submission_id,
            writer: writer.clone(),
        };
        let worker = Self {
            submission_id,
            receive_timeout,
            reader,
            writer,
            process,
            finished: false,
        };
        Ok((worker, aborter))
    }

    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    /// Messages up to, not including, `Bye`. A silent or broken worker
    /// ends the sequence with one error.
    pub fn poll_messages(&mut self) -> Messages<'_> {
        Messages { worker: self }
    }

    fn next_message(&mut self) -> Option<Result<IpcMessage>> {
        if self.finished {
            return None;
        }
        let mut reader = DeadlineReader {
            stream: &mut self.reader,
            deadline: Instant::now() + self.receive_timeout,
        };
        let message = match read_message::<_, IpcMessage>(&mut reader) {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.finished = true;
                return Some(Err(JudgeError::Ipc("worker hung up without saying goodbye".to_string())));
            }
            Err(JudgeError::Io(e)) if is_timeout(&e) => {
                self.finished = true;
                let seconds = self.receive_timeout.as_secs();
                error!(
                    "worker of {} has not sent a message in {} seconds",
                    self.submission_id, seconds
                );
                return Some(Err(JudgeError::WorkerTimeout { seconds }));
            }
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        if message == IpcMessage::Bye {
            self.finished = true;
            let mut writer = self.writer.lock();
            if let Err(e) = write_message(&mut *writer, &WorkerRequest::Close) {
                debug!("worker of {} left before close: {}", self.submission_id, e);
            }
            return None;
        }
        Some(Ok(message))
    }

    pub fn kill(&mut self) {
        if let Err(e) = self.process.kill() {
            warn!("failed to kill worker of {}: {}", self.submission_id, e);
        }
    }

    /// Wait up to `grace` for the worker to exit, then kill it
    pub fn reap(&mut self, grace: Duration) {
        match self.process.wait_timeout(grace) {
            Ok(true) => return,
            Ok(false) => warn!("worker of {} did not exit in {:?}, killing it", self.submission_id, grace),
            Err(e) => warn!("waiting for worker of {} failed: {}", self.submission_id, e),
        }
        self.kill();
        if let Err(e) = self.process.wait_timeout(grace) {
            warn!("worker of {} could not be reaped: {}", self.submission_id, e);
        }
    }
}

pub struct Messages<'a> {
    worker: &'a mut JudgeWorker,
}

impl Iterator for Messages<'_> {
    type Item = Result<IpcMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.worker.next_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::JudgeConfig;
    use crate::judge::Submission;
    use crate::problem::SubmissionMeta;
    use crate::worker::spawn::ThreadSpawner;

    fn request() -> GradeRequest {
        let submission = Submission {
            id: 3,
            problem_id: "sum-ab".to_string(),
            language: "PY3".to_string(),
            source: String::new(),
            time_limit: 2.0,
            memory_limit: 65536,
            short_circuit: false,
            meta: SubmissionMeta::new(),
        };
        GradeRequest::new(submission, &JudgeConfig::default())
    }

    /// Says hello, sends `messages`, then waits for close
    fn scripted(messages: Vec<IpcMessage>) -> ThreadSpawner {
        ThreadSpawner::new(move |mut stream| {
            let mut reader = stream.try_clone().unwrap();
            let _: Option<WorkerRequest> = read_message(&mut reader).unwrap();
            for message in &messages {
                write_message(&mut stream, message).unwrap();
            }
            while let Ok(Some(request)) = read_message::<_, WorkerRequest>(&mut reader) {
                if request == WorkerRequest::Close {
                    break;
                }
            }
        })
    }

    #[test]
    fn test_messages_end_at_bye() {
        let spawner = scripted(vec![
            IpcMessage::Hello,
            IpcMessage::GradingBegin { pretested: false },
            IpcMessage::GradingEnd,
            IpcMessage::Bye,
        ]);
        let (mut worker, _) = JudgeWorker::start(&spawner, request()).unwrap();
        let kinds: Vec<&str> = worker
            .poll_messages()
            .map(|message| message.unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["hello", "grading-begin", "grading-end"]);
        worker.reap(Duration::from_secs(5));
    }

    #[test]
    fn test_silent_worker_times_out() {
        let spawner = scripted(vec![IpcMessage::Hello]);
        let (mut worker, _) =
            JudgeWorker::start_with_timeout(&spawner, request(), Duration::from_millis(200)).unwrap();
        let messages: Vec<_> = worker.poll_messages().collect();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[1], Err(JudgeError::WorkerTimeout { .. })));
        worker.kill();
        worker.reap(Duration::from_secs(5));
    }

    #[test]
    fn test_trickled_message_still_times_out() {
        let spawner = ThreadSpawner::new(|mut stream| {
            let mut reader = stream.try_clone().unwrap();
            let _: Option<WorkerRequest> = read_message(&mut reader).unwrap();
            let mut frame = Vec::new();
            write_message(&mut frame, &IpcMessage::Hello).unwrap();
            // Each byte arrives well inside the timeout, the whole message does not
            for byte in frame {
                if std::io::Write::write_all(&mut stream, &[byte]).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        let (mut worker, _) =
            JudgeWorker::start_with_timeout(&spawner, request(), Duration::from_millis(300)).unwrap();
        let start = Instant::now();
        let messages: Vec<_> = worker.poll_messages().collect();
        assert!(matches!(messages.as_slice(), [Err(JudgeError::WorkerTimeout { .. })]), "{:?}", messages);
        assert!(start.elapsed() < Duration::from_secs(2));
        worker.kill();
        worker.reap(Duration::from_secs(5));
    }

    #[test]
    fn test_abort_after_exit_does_not_fail() {
        let spawner = ThreadSpawner::new(|mut stream| {
            let _: Result<Option<WorkerRequest>> = read_message(&mut stream);
        });
        let (mut worker, aborter) = JudgeWorker::start(&spawner, request()).unwrap();
        worker.reap(Duration::from_secs(5));
        let messages: Vec<_> = worker.poll_messages().collect();
        assert!(matches!(messages.as_slice(), [Err(JudgeError::Ipc(_))]));
        aborter.request_abort_grading();
        aborter.request_abort_grading();
    }
}
