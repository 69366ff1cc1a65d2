//! The executor contract and the plumbing every language shares: a private
//! working directory, default limits, environment, syscall allow-lists and
//! running a compiler under the tracer.

use crate::config::types::{ExecutorConfig, JudgeError, Result};
use crate::exec::{LaunchLimits, LaunchRequest, ProcessOutcome, TracedProcess};
use crate::sandbox::{Filesystem, FilesystemAccessRule, IsolateTracer, SyscallPolicy};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Syscalls any statically or dynamically linked program needs to start,
/// do I/O on inherited descriptors and exit. Path-bearing entries stay
/// path-checked; signal, rlimit and ioctl entries stay confined to the
/// caller's own process group.
pub const RUNTIME_SYSCALLS: &[&str] = &[
    "read", "write", "readv", "writev", "pread64", "pwrite64", "lseek", "_llseek", "close",
    "fstat", "fstat64", "dup", "dup2", "dup3", "fcntl", "fcntl64", "ioctl", "poll", "ppoll",
    "select", "pselect6", "mmap", "mmap2", "munmap", "mremap", "mprotect", "brk", "madvise",
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigaltstack", "exit", "exit_group",
    "arch_prctl", "set_tid_address", "set_robust_list", "get_robust_list", "rseq", "futex",
    "getpid", "gettid", "getrandom", "clock_gettime", "clock_gettime64", "clock_getres",
    "gettimeofday", "time", "nanosleep", "clock_nanosleep", "uname", "getrlimit", "ugetrlimit",
    "prlimit64", "sched_getaffinity", "sched_yield", "getuid", "geteuid", "getgid", "getegid",
    "getuid32", "geteuid32", "getgid32", "getegid32", "getcwd", "sysinfo", "getrusage",
    "open", "openat", "access", "faccessat", "faccessat2", "stat", "lstat", "stat64", "lstat64",
    "newfstatat", "fstatat64", "statx", "readlink", "readlinkat",
];

/// Extra syscalls a compiler driver needs to run its passes
pub const COMPILER_SYSCALLS: &[&str] = &[
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "wait4", "waitid", "pipe", "pipe2",
    "getppid", "getpgrp", "umask", "getdents", "getdents64", "fchdir", "chdir", "creat", "mkdir",
    "mkdirat", "unlink", "unlinkat", "rename", "renameat", "renameat2", "chmod", "fchmod",
    "fchmodat", "ftruncate", "truncate", "statfs", "fstatfs", "utimensat", "kill", "tgkill",
    "eventfd2", "memfd_create", "fadvise64", "sendfile", "copy_file_range", "prctl",
];

static VERSION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)+)").ok());

/// A located runtime binary and its version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Command name as advertised to the server (`gcc`, `python3`, ...)
    pub command: String,
    pub path: PathBuf,
    pub version: Vec<u32>,
}

impl RuntimeInfo {
    /// Resolve `command` through the config overrides, then `PATH`
    pub fn locate(command: &str, config: &ExecutorConfig) -> Option<Self> {
        let path = match config.runtime.get(command) {
            Some(path) if path.exists() => path.clone(),
            Some(path) => {
                log::warn!("configured runtime {} for {} does not exist", path.display(), command);
                return None;
            }
            None => which::which(command).ok()?,
        };
        let version = query_version(&path).unwrap_or_default();
        Some(Self {
            command: command.to_string(),
            path,
            version,
        })
    }

    pub fn version_string(&self) -> String {
        self.version
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Run `<path> --version` and pull the first dotted number out of it
pub fn query_version(path: &Path) -> Option<Vec<u32>> {
    let output = Command::new(path).arg("--version").output().ok()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_version(&text)
}

pub fn parse_version(text: &str) -> Option<Vec<u32>> {
    let found = VERSION.as_ref()?.captures(text)?.get(1)?;
    found
        .as_str()
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

/// Result of getting a submission ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Ready; a non-empty message carries compiler warnings
    Ready { message: Option<String> },
    Failed { log: String },
}

/// Per-submission state shared by every executor
#[derive(Debug)]
pub struct ExecutorBase {
    pub problem_id: String,
    pub source: Vec<u8>,
    pub unbuffered: bool,
    pub config: ExecutorConfig,
    pub runtime: RuntimeInfo,
    root: PathBuf,
    // Removed on drop
    _workdir: TempDir,
}

impl ExecutorBase {
    pub fn new(
        config: ExecutorConfig,
        runtime: RuntimeInfo,
        problem_id: impl Into<String>,
        source: Vec<u8>,
        unbuffered: bool,
    ) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("judgebox-")
            .tempdir_in(&config.temp_directory)?;
        // Policies match canonical paths, so the root must be one too.
        let root = workdir.path().canonicalize()?;
        Ok(Self {
            problem_id: problem_id.into(),
            source,
            unbuffered,
            config,
            runtime,
            root,
            _workdir: workdir,
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.root
    }

    pub fn write_source(&self, file_name: &str) -> Result<PathBuf> {
        let path = self.root.join(file_name);
        std::fs::write(&path, &self.source)?;
        Ok(path)
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "en_US.UTF8".to_string());
        if self.unbuffered {
            env.insert("JUDGEBOX_STDOUT_BUFFER_SIZE".to_string(), "0".to_string());
        }
        env
    }

    pub fn base_limits(&self) -> LaunchLimits {
        LaunchLimits {
            cpu_affinity: self.config.submission_cpu_affinity.clone(),
            ..LaunchLimits::default()
        }
    }

    /// Readable system directories plus the working directory, which is also
    /// the only writable place besides `/dev/null`
    pub fn filesystem_rules(&self) -> Filesystem {
        let own = Filesystem::new(
            vec![FilesystemAccessRule::recursive_dir(&self.root)],
            vec![FilesystemAccessRule::recursive_dir(&self.root)],
        );
        Filesystem::default_rules().extended(Some(&own))
    }

    fn compiler_policy(&self) -> SyscallPolicy {
        let extra = Filesystem::new(
            vec![
                FilesystemAccessRule::recursive_dir("/etc"),
                FilesystemAccessRule::recursive_dir("/tmp"),
                FilesystemAccessRule::recursive_dir("/proc/self"),
            ],
            vec![FilesystemAccessRule::recursive_dir("/tmp")],
        );
        let fs = self.filesystem_rules().extended(Some(&extra));
        IsolateTracer::new(fs.read, fs.write)
            .with_lookup_errno(true)
            .allow_all(RUNTIME_SYSCALLS)
            .allow_all(COMPILER_SYSCALLS)
            .into_policy()
    }

    /// Run a compiler under the tracer with the compiler limits
    pub fn compile(&self, argv: Vec<String>) -> Result<CompileOutcome> {
        let mut env = self.env();
        env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
        env.insert("TMPDIR".to_string(), self.root.display().to_string());

        let limit = self.config.compiler_output_character_limit;
        let limits = LaunchLimits {
            time: self.config.compiler_time_limit,
            wall_time: self.config.compiler_time_limit * 1.5,
            fsize: Some(self.config.compiler_size_limit.saturating_mul(1024)),
            ..self.base_limits()
        }
        .with_output_limits(limit, limit);

        let request = LaunchRequest {
            executable: self.runtime.path.clone(),
            argv,
            env,
            cwd: self.root.clone(),
            stdin: Vec::new(),
        };
        log::debug!("compiling {} with {}", self.problem_id, self.runtime.path.display());
        let outcome = TracedProcess::launch(request, &limits, self.compiler_policy())?.wait()?;
        Ok(compile_outcome(&outcome, limit))
    }
}

fn compile_outcome(outcome: &ProcessOutcome, limit: usize) -> CompileOutcome {
    let mut log = String::from_utf8_lossy(&outcome.stderr).into_owned();
    log.push_str(&String::from_utf8_lossy(&outcome.stdout));
    if log.len() > limit {
        let mut end = limit;
        while !log.is_char_boundary(end) {
            end -= 1;
        }
        log.truncate(end);
    }

    if outcome.succeeded() {
        let message = if log.trim().is_empty() { None } else { Some(log) };
        return CompileOutcome::Ready { message };
    }

    if outcome.timed_out {
        log.push_str("\ncompiler timed out");
    } else if let Some(violation) = &outcome.violation {
        log.push_str(&format!("\ncompiler was killed: {} is not allowed", violation.label()));
    }
    CompileOutcome::Failed { log }
}

/// What the core needs from a language
pub trait Executor: Send {
    fn name(&self) -> &'static str;

    fn base(&self) -> &ExecutorBase;

    /// Write the source and compile it, if the language needs that
    fn prepare(&mut self) -> Result<CompileOutcome>;

    fn executable(&self) -> PathBuf;

    /// argv of the program, `argv[0]` included
    fn command_line(&self) -> Vec<String>;

    fn allowed_syscalls(&self) -> Vec<&'static str> {
        RUNTIME_SYSCALLS.to_vec()
    }

    /// Deny filesystem lookups with ENOENT instead of a kill
    fn lookup_errno(&self) -> bool {
        false
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.base().env()
    }

    fn working_dir(&self) -> &Path {
        self.base().working_dir()
    }

    fn filesystem_rules(&self) -> Filesystem {
        self.base().filesystem_rules()
    }

    fn security(&self, extend: Option<&Filesystem>) -> SyscallPolicy {
        let fs = self.filesystem_rules().extended(extend);
        IsolateTracer::new(fs.read, fs.write)
            .with_lookup_errno(self.lookup_errno())
            .allow_all(&self.allowed_syscalls())
            .into_policy()
    }

    /// Limits for a run of `time` CPU seconds within `memory` KB
    fn launch_limits(&self, time: f64, memory: u64) -> LaunchLimits {
        LaunchLimits {
            time,
            memory: Some(memory),
            ..self.base().base_limits()
        }
    }

    fn launch(&self, args: &[String], limits: &LaunchLimits, policy: SyscallPolicy, stdin: Vec<u8>) -> Result<TracedProcess> {
        let mut argv = self.command_line();
        argv.extend(args.iter().cloned());
        let request = LaunchRequest {
            executable: self.executable(),
            argv,
            env: self.env(),
            cwd: self.working_dir().to_path_buf(),
            stdin,
        };
        TracedProcess::launch(request, limits, policy)
    }

    fn runtime_version(&self) -> String {
        let runtime = &self.base().runtime;
        format!("{} {}", runtime.command, runtime.version_string())
    }
}

/// A compiler exited cleanly without producing its output
pub(crate) fn missing_artifact(what: &Path) -> JudgeError {
    JudgeError::Compile(format!("{} was not produced", what.display()))
}
