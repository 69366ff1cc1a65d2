use super::limits::LaunchLimits;
use crate::config::types::{JudgeError, OutputStream, Result};
use crate::kernel::abi::Abi;
use crate::sandbox::policy::{SyscallPolicy, ViolationKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// What to run and where
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Resolved executable; `argv[0]` is passed through untouched
    pub executable: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub stdin: Vec<u8>,
}

/// The syscall that got a traced process killed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallViolation {
    pub abi: Abi,
    pub number: u64,
    pub name: Option<String>,
    pub kind: ViolationKind,
    pub detail: Option<String>,
}

impl SyscallViolation {
    /// Syscall name, or `#number` if the backend does not know it
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("#{}", self.number),
        }
    }
}

/// Raw figures reported once a traced process and its descendants are gone.
/// Classification into verdicts is left to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub violation: Option<SyscallViolation>,
    /// Killed by the wall-clock watchdog
    pub timed_out: bool,
    pub output_limit_exceeded: Option<(OutputStream, usize)>,
    /// Peak resident set in KB
    pub max_memory: u64,
    /// User plus system seconds
    pub cpu_time: f64,
    pub wall_time: f64,
    /// (voluntary, involuntary)
    pub context_switches: (u64, u64),
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && self.violation.is_none() && !self.timed_out
    }
}

#[derive(Debug, Default)]
struct KillState {
    pgid: Mutex<Option<i32>>,
    killed: AtomicBool,
    timed_out: AtomicBool,
    output_limit: Mutex<Option<(OutputStream, usize)>>,
}

/// Cloneable handle that kills a traced process group from any thread
#[derive(Debug, Clone, Default)]
pub struct ProcessKiller {
    state: Arc<KillState>,
}

impl ProcessKiller {
    /// A killer not yet bound to any process
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&self, pgid: i32) {
        *self.state.pgid.lock() = Some(pgid);
    }

    /// Forget the process group once it has been reaped, so a recycled pgid
    /// is never signalled.
    pub(crate) fn release(&self) {
        *self.state.pgid.lock() = None;
    }

    pub fn kill(&self) {
        let pgid = self.state.pgid.lock();
        if let Some(pgid) = *pgid {
            self.state.killed.store(true, Ordering::SeqCst);
            // SAFETY: plain kill(2); the group stays valid while the lock is held
            // because `release` takes the same lock after reaping.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }

    pub(crate) fn kill_for_timeout(&self) {
        self.state.timed_out.store(true, Ordering::SeqCst);
        self.kill();
    }

    pub fn was_killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.state.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn record_output_limit(&self, stream: OutputStream, limit: usize) {
        let mut slot = self.state.output_limit.lock();
        if slot.is_none() {
            *slot = Some((stream, limit));
        }
    }

    pub fn output_limit(&self) -> Option<(OutputStream, usize)> {
        *self.state.output_limit.lock()
    }
}

/// One untrusted process running under the tracer
pub struct TracedProcess {
    pid: i32,
    killer: ProcessKiller,
    handle: Option<JoinHandle<Result<ProcessOutcome>>>,
}

impl TracedProcess {
    /// Fork, confine and exec `request` under `policy`
    pub fn launch(request: LaunchRequest, limits: &LaunchLimits, policy: SyscallPolicy) -> Result<Self> {
        if request.argv.is_empty() {
            return Err(JudgeError::Sandbox("empty argv".to_string()));
        }
        launch_impl(request, limits, policy)
    }

    pub(crate) fn from_parts(
        pid: i32,
        killer: ProcessKiller,
        handle: JoinHandle<Result<ProcessOutcome>>,
    ) -> Self {
        Self {
            pid,
            killer,
            handle: Some(handle),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    pub fn kill(&self) {
        self.killer.kill();
    }

    /// Block until the process and everything it spawned is gone
    pub fn wait(mut self) -> Result<ProcessOutcome> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| JudgeError::Internal("tracer thread panicked".to_string()))?,
            None => Err(JudgeError::Internal("traced process already waited".to_string())),
        }
    }
}

impl Drop for TracedProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.killer.kill();
            let _ = handle.join();
        }
    }
}

#[cfg(target_os = "linux")]
fn launch_impl(request: LaunchRequest, limits: &LaunchLimits, policy: SyscallPolicy) -> Result<TracedProcess> {
    super::tracer::launch(request, limits, policy)
}

#[cfg(not(target_os = "linux"))]
fn launch_impl(_request: LaunchRequest, _limits: &LaunchLimits, _policy: SyscallPolicy) -> Result<TracedProcess> {
    Err(JudgeError::Sandbox(format!(
        "ptrace sandboxing is not available on {}",
        std::env::consts::OS
    )))
}
