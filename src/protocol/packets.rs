//! Packets exchanged with the grading server.
//!
//! Every packet is a JSON object whose `name` field says what it is; the
//! remaining fields use kebab-case keys.

use crate::config::types::Result;
use crate::executors::ExecutorVersions;
use crate::judge::Submission;
use crate::problem::SubmissionMeta;
use crate::verdict::TestResult;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server to judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum InboundPacket {
    Ping {
        when: f64,
    },
    GetCurrentSubmission {},
    SubmissionRequest(SubmissionRequest),
    TerminateSubmission {
        #[serde(default)]
        submission_id: Option<u64>,
    },
    Disconnect {},
    HandshakeSuccess {},
    /// A packet this judge does not understand; never sent
    #[serde(skip)]
    Unknown { name: String, payload: Value },
    /// A known name whose fields did not decode; never sent
    #[serde(skip)]
    Malformed { name: String, reason: String },
}

const KNOWN_INBOUND: &[&str] = &[
    "ping",
    "get-current-submission",
    "submission-request",
    "terminate-submission",
    "disconnect",
    "handshake-success",
];

impl InboundPacket {
    /// Decode a packet. Unknown names become [`InboundPacket::Unknown`] and
    /// known names with bad fields become [`InboundPacket::Malformed`].
    pub fn from_value(value: Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if KNOWN_INBOUND.contains(&name.as_str()) {
            return Ok(serde_json::from_value(value).unwrap_or_else(|e| {
                debug!("cannot decode `{}` packet: {}", name, e);
                InboundPacket::Malformed {
                    name,
                    reason: e.to_string(),
                }
            }));
        }
        debug!("unrecognised packet name `{}`", name);
        Ok(InboundPacket::Unknown { name, payload: value })
    }

    pub fn name(&self) -> &str {
        match self {
            InboundPacket::Ping { .. } => "ping",
            InboundPacket::GetCurrentSubmission {} => "get-current-submission",
            InboundPacket::SubmissionRequest(_) => "submission-request",
            InboundPacket::TerminateSubmission { .. } => "terminate-submission",
            InboundPacket::Disconnect {} => "disconnect",
            InboundPacket::HandshakeSuccess {} => "handshake-success",
            InboundPacket::Unknown { name, .. } | InboundPacket::Malformed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionRequest {
    pub submission_id: u64,
    pub problem_id: String,
    pub language: String,
    pub source: String,
    pub time_limit: f64,
    pub memory_limit: u64,
    #[serde(default)]
    pub short_circuit: bool,
    #[serde(default)]
    pub meta: SubmissionMeta,
}

impl From<SubmissionRequest> for Submission {
    fn from(request: SubmissionRequest) -> Self {
        Submission {
            id: request.submission_id,
            problem_id: request.problem_id,
            language: request.language,
            source: request.source,
            time_limit: request.time_limit,
            memory_limit: request.memory_limit,
            short_circuit: request.short_circuit,
            meta: request.meta,
        }
    }
}

/// Judge to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum OutboundPacket {
    Handshake {
        problems: Vec<(String, f64)>,
        executors: ExecutorVersions,
        id: String,
        key: String,
    },
    PingResponse {
        when: f64,
        time: f64,
        load: f64,
        cpu_count: usize,
    },
    SubmissionAcknowledged {
        submission_id: u64,
    },
    CurrentSubmissionId {
        submission_id: Option<u64>,
    },
    CompileError {
        submission_id: u64,
        log: String,
    },
    CompileMessage {
        submission_id: u64,
        log: String,
    },
    GradingBegin {
        submission_id: u64,
        pretested: bool,
    },
    GradingEnd {
        submission_id: u64,
    },
    BatchBegin {
        submission_id: u64,
    },
    BatchEnd {
        submission_id: u64,
    },
    SubmissionTerminated {
        submission_id: u64,
    },
    InternalError {
        submission_id: u64,
        message: String,
    },
    TestCaseStatus {
        submission_id: u64,
        cases: Vec<CaseStatus>,
    },
}

impl OutboundPacket {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundPacket::Handshake { .. } => "handshake",
            OutboundPacket::PingResponse { .. } => "ping-response",
            OutboundPacket::SubmissionAcknowledged { .. } => "submission-acknowledged",
            OutboundPacket::CurrentSubmissionId { .. } => "current-submission-id",
            OutboundPacket::CompileError { .. } => "compile-error",
            OutboundPacket::CompileMessage { .. } => "compile-message",
            OutboundPacket::GradingBegin { .. } => "grading-begin",
            OutboundPacket::GradingEnd { .. } => "grading-end",
            OutboundPacket::BatchBegin { .. } => "batch-begin",
            OutboundPacket::BatchEnd { .. } => "batch-end",
            OutboundPacket::SubmissionTerminated { .. } => "submission-terminated",
            OutboundPacket::InternalError { .. } => "internal-error",
            OutboundPacket::TestCaseStatus { .. } => "test-case-status",
        }
    }
}

/// One entry of a `test-case-status` packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaseStatus {
    pub position: usize,
    pub status: u32,
    pub time: f64,
    pub points: f64,
    pub total_points: f64,
    pub memory: u64,
    pub output: String,
    pub feedback: String,
    pub extended_feedback: String,
    pub voluntary_context_switches: u64,
    pub involuntary_context_switches: u64,
    pub runtime_version: String,
}

impl From<&TestResult> for CaseStatus {
    fn from(result: &TestResult) -> Self {
        Self {
            position: result.position,
            status: result.result_flag.bits(),
            time: result.execution_time,
            points: result.points,
            total_points: result.total_points,
            memory: result.max_memory,
            output: result.output(),
            feedback: result.feedback.clone(),
            extended_feedback: result.extended_feedback.clone(),
            voluntary_context_switches: result.context_switches.0,
            involuntary_context_switches: result.context_switches.1,
            runtime_version: result.runtime_version.clone(),
        }
    }
}
