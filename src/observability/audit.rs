/// Security event logging for the sandbox and the worker supervisor
///
/// Events go to the `judgebox::audit` log target. When an audit file has been
/// configured each event is also appended to it as one JSON line.
use crate::config::types::{JudgeError, Result};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

pub const TARGET: &str = "judgebox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    SyscallDenied,
    FilesystemDenied,
    WallTimeExceeded,
    OutputLimitExceeded,
    WorkerForceKilled,
    HandshakeRejected,
}

impl AuditKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            AuditKind::SyscallDenied => Severity::High,
            AuditKind::FilesystemDenied => Severity::High,
            AuditKind::WorkerForceKilled => Severity::High,
            AuditKind::HandshakeRejected => Severity::Medium,
            AuditKind::WallTimeExceeded => Severity::Low,
            AuditKind::OutputLimitExceeded => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub severity: Severity,
    pub timestamp: SystemTime,
    pub details: String,
    pub pid: Option<i32>,
    pub submission_id: Option<u64>,
    pub file_path: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, details: String) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            timestamp: SystemTime::now(),
            details,
            pid: None,
            submission_id: None,
            file_path: None,
        }
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_submission(mut self, id: u64) -> Self {
        self.submission_id = Some(id);
        self
    }

    pub fn with_file_path(mut self, path: &Path) -> Self {
        self.file_path = Some(path.display().to_string());
        self
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "kind": self.kind,
            "severity": self.severity,
            "details": self.details,
            "pid": self.pid,
            "submission_id": self.submission_id,
            "file_path": self.file_path,
            "process_id": std::process::id(),
        })
    }
}

struct AuditFile {
    file: Mutex<File>,
}

static AUDIT_FILE: OnceCell<AuditFile> = OnceCell::new();

/// Start appending audit events to `path`. Later calls in the same process
/// keep the first file.
pub fn init_audit_file(path: &Path) -> Result<()> {
    if AUDIT_FILE.get().is_some() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| JudgeError::Config(format!("Failed to create audit log directory: {}", e)))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| JudgeError::Config(format!("Failed to open audit log {}: {}", path.display(), e)))?;
    let audit = AuditFile {
        file: Mutex::new(file),
    };
    if AUDIT_FILE.set(audit).is_ok() {
        info!(target: TARGET, "Audit events appended to {}", path.display());
    }
    Ok(())
}

pub fn record(event: AuditEvent) {
    match event.severity {
        Severity::High => warn!(target: TARGET, "{:?}: {}", event.kind, event.details),
        Severity::Medium => info!(target: TARGET, "{:?}: {}", event.kind, event.details),
        Severity::Low => log::debug!(target: TARGET, "{:?}: {}", event.kind, event.details),
    }

    if let Some(audit) = AUDIT_FILE.get() {
        let mut file = audit.file.lock();
        if let Err(e) = writeln!(file, "{}", event.to_json()).and_then(|_| file.flush()) {
            error!(target: TARGET, "Failed to write audit log: {}", e);
        }
    }
}

pub fn syscall_denied(pid: i32, syscall: &str, detail: Option<&str>) {
    let details = match detail {
        Some(detail) if detail != syscall => format!("{} ({})", syscall, detail),
        _ => syscall.to_string(),
    };
    record(AuditEvent::new(AuditKind::SyscallDenied, details).with_pid(pid));
}

pub fn filesystem_denied(pid: i32, syscall: &str, mode: &str, path: &Path) {
    record(
        AuditEvent::new(
            AuditKind::FilesystemDenied,
            format!("{} denied {} access", syscall, mode),
        )
        .with_pid(pid)
        .with_file_path(path),
    );
}

pub fn wall_time_exceeded(pid: i32, seconds: f64) {
    record(
        AuditEvent::new(
            AuditKind::WallTimeExceeded,
            format!("killed after {:.3}s wall time", seconds),
        )
        .with_pid(pid),
    );
}

pub fn output_limit_exceeded(pid: i32, stream: &str, limit: usize) {
    record(
        AuditEvent::new(
            AuditKind::OutputLimitExceeded,
            format!("{} exceeded {} bytes", stream, limit),
        )
        .with_pid(pid),
    );
}

pub fn worker_force_killed(submission_id: u64, reason: &str) {
    record(
        AuditEvent::new(AuditKind::WorkerForceKilled, reason.to_string())
            .with_submission(submission_id),
    );
}

pub fn handshake_rejected(server: &str) {
    record(AuditEvent::new(
        AuditKind::HandshakeRejected,
        format!("{} did not accept the handshake", server),
    ));
}
