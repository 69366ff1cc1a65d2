//! The judge state machine.
//!
//! [`Judge::run`] owns the inbound packet loop. Grading a submission takes
//! the exclusivity lock, starts a worker and hands both to a supervisor
//! thread that translates worker messages into packets. The supervisor owns
//! the lock guard, so the judge is idle again however the supervisor exits.

use super::submission::Submission;
use crate::config::types::{JudgeConfig, JudgeError, Result};
use crate::observability::{audit, HostLoad, JudgeMetrics};
use crate::protocol::{CaseStatus, InboundPacket, OutboundPacket, PacketManager, PacketSender};
use crate::worker::{GradeRequest, IpcMessage, JudgeWorker, WorkerAborter, WorkerSpawner};
use log::{debug, error, info, warn};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(5);

struct ActiveGrade {
    submission_id: u64,
    aborter: WorkerAborter,
}

pub struct Judge {
    config: Arc<JudgeConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    grading_lock: Arc<Mutex<()>>,
    current: Arc<Mutex<Option<ActiveGrade>>>,
    supervisor: Option<JoinHandle<()>>,
    metrics: Arc<JudgeMetrics>,
    worker_timeout: Option<Duration>,
    reap_grace: Duration,
}

impl Judge {
    pub fn new(config: JudgeConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config: Arc::new(config),
            spawner,
            grading_lock: Arc::new(Mutex::new(())),
            current: Arc::new(Mutex::new(None)),
            supervisor: None,
            metrics: Arc::new(JudgeMetrics::new()),
            worker_timeout: None,
            reap_grace: DEFAULT_REAP_GRACE,
        }
    }

    /// Fixed receive timeout instead of `max(60, 2 * time_limit)`
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = Some(timeout);
        self
    }

    /// How long a worker may take to exit after `Bye`
    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &JudgeMetrics {
        &self.metrics
    }

    pub fn is_grading(&self) -> bool {
        self.grading_lock.is_locked()
    }

    pub fn current_submission(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|active| active.submission_id)
    }

    /// Serve one connection. `Ok` after a `disconnect` packet, `Err` when
    /// the connection is lost. Any grade in flight is aborted either way.
    pub fn run(&mut self, mut packets: PacketManager) -> Result<()> {
        packets.start_sender()?;
        let sender = packets.sender();
        let outcome = self.receive_loop(&packets, &sender);
        self.abort_grading();
        self.join_supervisor();
        packets.close();
        info!("judge stats: {}", self.metrics.summary());
        outcome
    }

    fn receive_loop(&mut self, packets: &PacketManager, sender: &PacketSender) -> Result<()> {
        loop {
            let packet = packets.recv()?;
            debug!("received {} packet", packet.name());
            match packet {
                InboundPacket::Ping { when } => sender.send(ping_response(when)),
                InboundPacket::GetCurrentSubmission {} => sender.send(OutboundPacket::CurrentSubmissionId {
                    submission_id: self.current_submission(),
                }),
                InboundPacket::SubmissionRequest(request) => self.begin_grading(request.into(), sender),
                InboundPacket::TerminateSubmission { submission_id } => self.terminate(submission_id),
                InboundPacket::Disconnect {} => {
                    info!("Received disconnect request, shutting down...");
                    return Ok(());
                }
                InboundPacket::HandshakeSuccess {} => warn!("unexpected handshake-success after handshake"),
                InboundPacket::Unknown { name, payload } => {
                    error!("Unknown packet {}, payload {}", name, payload)
                }
                InboundPacket::Malformed { name, reason } => {
                    error!("Dropping malformed {} packet: {}", name, reason)
                }
            }
        }
    }

    /// Start grading unless a grade is already in flight; a busy judge
    /// answers with `internal-error` and never acknowledges
    pub fn begin_grading(&mut self, submission: Submission, sender: &PacketSender) {
        let submission_id = submission.id;
        let Some(guard) = self.grading_lock.try_lock_arc() else {
            warn!(
                "rejecting submission {}: still grading {:?}",
                submission_id,
                self.current_submission()
            );
            self.metrics.submissions_rejected_busy.inc();
            sender.send(OutboundPacket::InternalError {
                submission_id,
                message: "judge is busy grading another submission".to_string(),
            });
            return;
        };
        // The previous supervisor dropped its guard, so it is about to exit
        self.join_supervisor();

        sender.send(OutboundPacket::SubmissionAcknowledged { submission_id });
        self.metrics.submissions_accepted.inc();
        info!(
            "Accepted submission: {}, executor: {}, problem: {}",
            submission_id, submission.language, submission.problem_id
        );

        let request = GradeRequest::new(submission, &self.config);
        let started = match self.worker_timeout {
            Some(timeout) => JudgeWorker::start_with_timeout(self.spawner.as_ref(), request, timeout),
            None => JudgeWorker::start(self.spawner.as_ref(), request),
        };
        let (worker, aborter) = match started {
            Ok(started) => started,
            Err(e) => {
                error!("failed to start worker for {}: {}", submission_id, e);
                self.metrics.internal_errors.inc();
                sender.send(OutboundPacket::InternalError {
                    submission_id,
                    message: e.to_string(),
                });
                return;
            }
        };
        *self.current.lock() = Some(ActiveGrade { submission_id, aborter });

        let supervisor = GradingSupervisor {
            worker,
            sender: sender.clone(),
            current: self.current.clone(),
            metrics: self.metrics.clone(),
            reap_grace: self.reap_grace,
            _guard: guard,
        };
        match thread::Builder::new()
            .name(format!("grading-{}", submission_id))
            .spawn(move || supervisor.run())
        {
            Ok(handle) => self.supervisor = Some(handle),
            Err(e) => {
                // The supervisor was dropped with the closure: lock released
                error!("failed to start grading thread for {}: {}", submission_id, e);
                self.metrics.internal_errors.inc();
                sender.send(OutboundPacket::InternalError {
                    submission_id,
                    message: e.to_string(),
                });
            }
        }
    }

    fn terminate(&self, submission_id: Option<u64>) {
        let current = self.current.lock();
        match current.as_ref() {
            None => warn!("terminate-submission received while idle"),
            Some(active) if submission_id.is_some_and(|id| id != active.submission_id) => warn!(
                "ignoring terminate-submission for {:?}, grading {}",
                submission_id, active.submission_id
            ),
            Some(active) => {
                info!("Terminating submission {}", active.submission_id);
                active.aborter.request_abort_grading();
            }
        }
    }

    /// Ask the worker in flight, if any, to stop
    pub fn abort_grading(&self) {
        if let Some(active) = self.current.lock().as_ref() {
            active.aborter.request_abort_grading();
        }
    }

    fn join_supervisor(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                error!("grading supervisor panicked");
            }
        }
    }
}

fn ping_response(when: f64) -> OutboundPacket {
    let load = HostLoad::sample();
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64());
    OutboundPacket::PingResponse {
        when,
        time,
        load: load.load,
        cpu_count: load.cpu_count,
    }
}

/// Outbound packet for a worker message; `None` for channel bookkeeping
pub fn packet_for(submission_id: u64, message: IpcMessage) -> Option<OutboundPacket> {
    let packet = match message {
        IpcMessage::Hello | IpcMessage::Bye => return None,
        IpcMessage::CompileMessage { log } => OutboundPacket::CompileMessage { submission_id, log },
        IpcMessage::CompileError { log } => OutboundPacket::CompileError { submission_id, log },
        IpcMessage::GradingBegin { pretested } => OutboundPacket::GradingBegin {
            submission_id,
            pretested,
        },
        IpcMessage::GradingAborted => OutboundPacket::SubmissionTerminated { submission_id },
        IpcMessage::GradingEnd => OutboundPacket::GradingEnd { submission_id },
        IpcMessage::BatchBegin { .. } => OutboundPacket::BatchBegin { submission_id },
        IpcMessage::BatchEnd { .. } => OutboundPacket::BatchEnd { submission_id },
        IpcMessage::Result { result } => OutboundPacket::TestCaseStatus {
            submission_id,
            cases: vec![CaseStatus::from(result.as_ref())],
        },
        IpcMessage::UnhandledException { message } => OutboundPacket::InternalError { submission_id, message },
    };
    Some(packet)
}

struct GradingSupervisor {
    worker: JudgeWorker,
    sender: PacketSender,
    current: Arc<Mutex<Option<ActiveGrade>>>,
    metrics: Arc<JudgeMetrics>,
    reap_grace: Duration,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl GradingSupervisor {
    fn run(mut self) {
        let submission_id = self.worker.submission_id();
        let mut unresponsive = false;
        for message in self.worker.poll_messages() {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    if let JudgeError::WorkerTimeout { seconds } = e {
                        error!("worker for {} unresponsive for {} seconds", submission_id, seconds);
                        unresponsive = true;
                    } else {
                        error!("lost worker for {}: {}", submission_id, e);
                    }
                    self.metrics.internal_errors.inc();
                    self.sender.send(OutboundPacket::InternalError {
                        submission_id,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            match &message {
                IpcMessage::Hello => debug!("worker for {} is ready", submission_id),
                IpcMessage::CompileError { log } => {
                    info!("Failed compiling submission {}!\n{}", submission_id, log.trim_end())
                }
                IpcMessage::GradingAborted => {
                    info!("Grading of {} aborted", submission_id);
                    self.metrics.submissions_terminated.inc();
                }
                IpcMessage::UnhandledException { message } => {
                    warn!("worker for {} failed: {}", submission_id, message);
                    self.metrics.internal_errors.inc();
                }
                _ => {}
            }
            if let Some(packet) = packet_for(submission_id, message) {
                self.sender.send(packet);
            }
        }

        if unresponsive {
            audit::worker_force_killed(submission_id, "no message within the receive timeout");
            self.metrics.workers_force_killed.inc();
            self.worker.kill();
        }
        self.worker.reap(self.reap_grace);
        info!("Done grading {}", submission_id);
    }
}

impl Drop for GradingSupervisor {
    fn drop(&mut self) {
        // Runs before `_guard` is released
        self.current.lock().take();
    }
}
