//! Messages between the judge and a worker, and their framing.
//!
//! Each message is a `u32` big-endian length followed by a JSON envelope
//! `{"version": 1, "message": ...}`. A version mismatch is a channel error.

use crate::config::types::{ExecutorConfig, ExecutorManagerConfig, GraderManagerConfig, JudgeConfig, JudgeError, Result};
use crate::judge::Submission;
use crate::verdict::TestResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

pub const IPC_VERSION: u32 = 1;

/// Largest message either side accepts
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Everything a worker needs to grade one submission on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRequest {
    pub submission: Submission,
    pub problem_storage_globs: Vec<String>,
    pub executors: ExecutorManagerConfig,
    pub graders: GraderManagerConfig,
    pub executor: ExecutorConfig,
    pub only_executors: Option<Vec<String>>,
    pub exclude_executors: Option<Vec<String>>,
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl GradeRequest {
    pub fn new(submission: Submission, config: &JudgeConfig) -> Self {
        Self {
            submission,
            problem_storage_globs: config.problem_storage_globs.clone(),
            executors: config.executors.clone(),
            graders: config.graders.clone(),
            executor: config.executor.clone(),
            only_executors: config.only_executors.clone(),
            exclude_executors: config.exclude_executors.clone(),
            audit_log: config.audit_log.clone(),
        }
    }
}

/// Judge to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum WorkerRequest {
    Grade(Box<GradeRequest>),
    Abort,
    Close,
}

/// Worker to judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum IpcMessage {
    Hello,
    CompileMessage { log: String },
    CompileError { log: String },
    GradingBegin { pretested: bool },
    GradingAborted,
    GradingEnd,
    BatchBegin { batch: usize },
    BatchEnd { batch: usize },
    Result { result: Box<TestResult> },
    UnhandledException { message: String },
    Bye,
}

impl IpcMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            IpcMessage::Hello => "hello",
            IpcMessage::CompileMessage { .. } => "compile-message",
            IpcMessage::CompileError { .. } => "compile-error",
            IpcMessage::GradingBegin { .. } => "grading-begin",
            IpcMessage::GradingAborted => "grading-aborted",
            IpcMessage::GradingEnd => "grading-end",
            IpcMessage::BatchBegin { .. } => "batch-begin",
            IpcMessage::BatchEnd { .. } => "batch-end",
            IpcMessage::Result { .. } => "result",
            IpcMessage::UnhandledException { .. } => "unhandled-exception",
            IpcMessage::Bye => "bye",
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    message: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    message: T,
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = serde_json::to_vec(&EnvelopeRef {
        version: IPC_VERSION,
        message,
    })?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(JudgeError::Ipc(format!("message of {} bytes is too large", body.len())));
    }
    let length = (body.len() as u32).to_be_bytes();
    writer
        .write_all(&length)
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(|e| JudgeError::Ipc(format!("write failed: {}", e)))
}

/// Read one message; `Ok(None)` when the peer closed the channel between
/// messages. A read timeout on the socket surfaces as `Io` with
/// `WouldBlock`/`TimedOut` so callers can tell it apart.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut length = [0u8; 4];
    match reader.read_exact(&mut length) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) if is_timeout(&e) => return Err(JudgeError::Io(e)),
        Err(e) => return Err(JudgeError::Ipc(format!("read failed: {}", e))),
    }

    let length = u32::from_be_bytes(length) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(JudgeError::Ipc(format!("message of {} bytes is too large", length)));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => JudgeError::Ipc("channel closed mid-message".to_string()),
        _ if is_timeout(&e) => JudgeError::Io(e),
        _ => JudgeError::Ipc(format!("read failed: {}", e)),
    })?;

    let envelope: Envelope<T> =
        serde_json::from_slice(&body).map_err(|e| JudgeError::Ipc(format!("malformed message: {}", e)))?;
    if envelope.version != IPC_VERSION {
        return Err(JudgeError::Ipc(format!(
            "peer speaks version {}, expected {}",
            envelope.version, IPC_VERSION
        )));
    }
    Ok(Some(envelope.message))
}

pub fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
