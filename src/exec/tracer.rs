//! Fork/exec under ptrace and the syscall-stop loop.
//!
//! The tracer thread forks the child, so it is the only thread allowed to
//! issue ptrace requests against it. Everything the child touches between
//! fork and execve is prepared up front; the child itself only makes
//! async-signal-safe libc calls.

use super::limits::LaunchLimits;
use super::output::{capture_stream, feed_stdin};
use super::process::{LaunchRequest, ProcessKiller, ProcessOutcome, SyscallViolation, TracedProcess};
use crate::config::types::{JudgeError, OutputStream, Result};
use crate::kernel::abi::Abi;
use crate::kernel::ptrace::{entry_gate, read_registers, set_return_value, skip_syscall, PtraceMemory};
use crate::observability::audit;
use crate::sandbox::policy::{Decision, SyscallPolicy, Violation, ViolationKind};
use crossbeam_channel::{bounded, RecvTimeoutError};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, pipe2, setpgid, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::thread;
use std::time::{Duration, Instant};

const STAGE_SETPGID: u8 = 1;
const STAGE_CHDIR: u8 = 2;
const STAGE_DUP2: u8 = 3;
const STAGE_RLIMIT: u8 = 4;
const STAGE_PERSONALITY: u8 = 5;
const STAGE_AFFINITY: u8 = 6;
const STAGE_TRACEME: u8 = 7;
const STAGE_EXECVE: u8 = 8;

/// Highest fd the child bothers closing before exec
const CLOSE_FD_CEILING: i32 = 4096;

fn stage_name(stage: u8) -> &'static str {
    match stage {
        STAGE_SETPGID => "setpgid",
        STAGE_CHDIR => "chdir",
        STAGE_DUP2 => "dup2",
        STAGE_RLIMIT => "setrlimit",
        STAGE_PERSONALITY => "personality",
        STAGE_AFFINITY => "sched_setaffinity",
        STAGE_TRACEME => "ptrace(TRACEME)",
        STAGE_EXECVE => "execve",
        _ => "unknown stage",
    }
}

fn options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_EXITKILL
}

fn cstring(value: &[u8], what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| JudgeError::Sandbox(format!("{} contains a NUL byte", what)))
}

fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else if secs.is_finite() {
        Duration::ZERO
    } else {
        Duration::from_secs(u32::MAX as u64)
    }
}

struct Pipe {
    read: File,
    write: File,
}

fn pipe() -> Result<Pipe> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just handed us both descriptors
    Ok(unsafe {
        Pipe {
            read: File::from_raw_fd(read),
            write: File::from_raw_fd(write),
        }
    })
}

/// Child-side state, fully built before fork
struct ChildSetup {
    executable: CString,
    // The pointer arrays below borrow from these
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: CString,
    stdio: [RawFd; 3],
    error_pipe: RawFd,
    rlimits: Vec<(libc::__rlimit_resource_t, libc::rlim_t, libc::rlim_t)>,
    personality: u64,
    cpu_set: Option<libc::cpu_set_t>,
}

impl ChildSetup {
    fn new(request: &LaunchRequest, limits: &LaunchLimits, stdio: [RawFd; 3], error_pipe: RawFd) -> Result<Self> {
        let executable = cstring(request.executable.as_os_str().as_bytes(), "executable path")?;
        let argv = request
            .argv
            .iter()
            .map(|arg| cstring(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;
        let envp = request
            .env
            .iter()
            .map(|(key, value)| cstring(format!("{}={}", key, value).as_bytes(), "environment"))
            .collect::<Result<Vec<_>>>()?;
        let cwd = cstring(request.cwd.as_os_str().as_bytes(), "working directory")?;

        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|var| var.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let mut rlimits = Vec::new();
        let (cpu_soft, cpu_hard) = limits.cpu_rlimit();
        rlimits.push((libc::RLIMIT_CPU, cpu_soft as libc::rlim_t, cpu_hard as libc::rlim_t));
        if let Some(bytes) = limits.address_space_rlimit() {
            rlimits.push((libc::RLIMIT_AS, bytes as libc::rlim_t, bytes as libc::rlim_t));
        }
        if let Some(fsize) = limits.fsize {
            rlimits.push((libc::RLIMIT_FSIZE, fsize as libc::rlim_t, fsize as libc::rlim_t));
        }
        if let Some(nproc) = limits.nproc {
            rlimits.push((libc::RLIMIT_NPROC, nproc as libc::rlim_t, nproc as libc::rlim_t));
        }

        let cpu_set = match &limits.cpu_affinity {
            Some(cores) if !cores.is_empty() => {
                // SAFETY: cpu_set_t is plain data; all-zero is the empty set
                let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
                for &core in cores {
                    // SAFETY: CPU_SET bounds-checks against the set size
                    unsafe { libc::CPU_SET(core, &mut set) };
                }
                Some(set)
            }
            _ => None,
        };

        Ok(Self {
            executable,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            cwd,
            stdio,
            error_pipe,
            rlimits,
            personality: limits.personality,
            cpu_set,
        })
    }
}

fn child_fail(error_pipe: RawFd, stage: u8) -> ! {
    let errno = Errno::last() as i32;
    let mut message = [0u8; 5];
    message[0] = stage;
    message[1..].copy_from_slice(&errno.to_ne_bytes());
    // SAFETY: write(2) and _exit(2) are async-signal-safe
    unsafe {
        libc::write(error_pipe, message.as_ptr().cast(), message.len());
        libc::_exit(126)
    }
}

/// Runs in the forked child. No allocation, no locks.
unsafe fn exec_child(setup: &ChildSetup) -> ! {
    if libc::setpgid(0, 0) != 0 {
        child_fail(setup.error_pipe, STAGE_SETPGID);
    }

    // The judge ignores SIGPIPE and ignored dispositions survive execve.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

    if libc::chdir(setup.cwd.as_ptr()) != 0 {
        child_fail(setup.error_pipe, STAGE_CHDIR);
    }

    for (target, &fd) in setup.stdio.iter().enumerate() {
        let target = target as RawFd;
        let rc = if fd == target {
            libc::fcntl(fd, libc::F_SETFD, 0)
        } else {
            libc::dup2(fd, target)
        };
        if rc < 0 {
            child_fail(setup.error_pipe, STAGE_DUP2);
        }
    }
    for fd in 3..CLOSE_FD_CEILING {
        if fd != setup.error_pipe {
            libc::close(fd);
        }
    }

    for &(resource, soft, hard) in &setup.rlimits {
        let limit = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        if libc::setrlimit(resource, &limit) != 0 {
            child_fail(setup.error_pipe, STAGE_RLIMIT);
        }
    }

    if setup.personality != 0 && libc::personality(setup.personality as libc::c_ulong) == -1 {
        child_fail(setup.error_pipe, STAGE_PERSONALITY);
    }

    if let Some(set) = &setup.cpu_set {
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) != 0 {
            child_fail(setup.error_pipe, STAGE_AFFINITY);
        }
    }

    if libc::ptrace(
        libc::PTRACE_TRACEME,
        0,
        std::ptr::null_mut::<libc::c_void>(),
        std::ptr::null_mut::<libc::c_void>(),
    ) != 0
    {
        child_fail(setup.error_pipe, STAGE_TRACEME);
    }
    // Hand control to the tracer before running a single instruction of the target.
    libc::kill(libc::getpid(), libc::SIGSTOP);

    libc::execve(
        setup.executable.as_ptr(),
        setup.argv_ptrs.as_ptr(),
        setup.envp_ptrs.as_ptr(),
    );
    child_fail(setup.error_pipe, STAGE_EXECVE)
}

pub(super) fn launch(request: LaunchRequest, limits: &LaunchLimits, policy: SyscallPolicy) -> Result<TracedProcess> {
    let stdin = pipe()?;
    let stdout = pipe()?;
    let stderr = pipe()?;
    let errors = pipe()?;

    let killer = ProcessKiller::detached();
    let thread_killer = killer.clone();
    let limits = limits.clone();
    let (pid_tx, pid_rx) = bounded::<Result<i32>>(1);

    let handle = thread::Builder::new()
        .name("tracer".to_string())
        .spawn(move || -> Result<ProcessOutcome> {
            let child_ends = [stdin.read, stdout.write, stderr.write];
            let setup = match ChildSetup::new(
                &request,
                &limits,
                [
                    child_ends[0].as_raw_fd(),
                    child_ends[1].as_raw_fd(),
                    child_ends[2].as_raw_fd(),
                ],
                errors.write.as_raw_fd(),
            ) {
                Ok(setup) => setup,
                Err(err) => {
                    let message = err.to_string();
                    let _ = pid_tx.send(Err(err));
                    return Err(JudgeError::Sandbox(message));
                }
            };

            // SAFETY: the child only runs exec_child, which is async-signal-safe.
            let child = match unsafe { fork() } {
                Ok(ForkResult::Child) => unsafe { exec_child(&setup) },
                Ok(ForkResult::Parent { child }) => child,
                Err(errno) => {
                    let _ = pid_tx.send(Err(errno.into()));
                    return Err(JudgeError::Sandbox(format!("fork failed: {}", errno)));
                }
            };
            drop(child_ends);
            drop(errors.write);
            // Also done by the child; whoever runs first closes the race.
            let _ = setpgid(child, child);
            thread_killer.bind(child.as_raw());

            let out_reader = capture_stream(
                stdout.read,
                OutputStream::Stdout,
                limits.stdout_limit,
                limits.kill_on_output_limit,
                thread_killer.clone(),
            );
            let err_reader = capture_stream(
                stderr.read,
                OutputStream::Stderr,
                limits.stderr_limit,
                limits.kill_on_output_limit,
                thread_killer.clone(),
            );
            let stdin_writer = feed_stdin(stdin.write, request.stdin);

            let (done_tx, done_rx) = bounded::<()>(0);
            let wall = duration_from_secs(limits.wall_time);
            let watchdog_killer = thread_killer.clone();
            let watchdog = thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(wall) {
                    audit::wall_time_exceeded(child.as_raw(), wall.as_secs_f64());
                    watchdog_killer.kill_for_timeout();
                }
            });

            let _ = pid_tx.send(Ok(child.as_raw()));
            let start = Instant::now();
            let traced = trace(child, &policy, &thread_killer);
            let wall_time = start.elapsed().as_secs_f64();
            thread_killer.release();
            drop(done_tx);
            let _ = watchdog.join();

            let stdout = out_reader.join().unwrap_or_default();
            let stderr = err_reader.join().unwrap_or_default();
            let _ = stdin_writer.join();
            if let Some((stream, limit)) = thread_killer.output_limit() {
                audit::output_limit_exceeded(child.as_raw(), &stream.to_string(), limit);
            }

            let mut setup_error = Vec::new();
            let mut error_read = errors.read;
            let _ = error_read.read_to_end(&mut setup_error);
            if setup_error.len() >= 5 {
                let mut errno = [0u8; 4];
                errno.copy_from_slice(&setup_error[1..5]);
                return Err(JudgeError::Sandbox(format!(
                    "child setup failed at {}: {}",
                    stage_name(setup_error[0]),
                    Errno::from_i32(i32::from_ne_bytes(errno))
                )));
            }

            let report = traced?;
            Ok(ProcessOutcome {
                exit_code: report.exit_code,
                signal: report.signal,
                violation: report.violation,
                timed_out: thread_killer.timed_out(),
                output_limit_exceeded: thread_killer.output_limit(),
                max_memory: report.max_rss_kb,
                cpu_time: report.cpu_time,
                wall_time,
                context_switches: report.context_switches,
                stdout,
                stderr,
            })
        })?;

    match pid_rx.recv() {
        Ok(Ok(pid)) => Ok(TracedProcess::from_parts(pid, killer, handle)),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err)
        }
        Err(_) => {
            let _ = handle.join();
            Err(JudgeError::Internal("tracer thread exited before launch".to_string()))
        }
    }
}

#[derive(Debug, Default)]
struct TraceReport {
    exit_code: Option<i32>,
    signal: Option<i32>,
    violation: Option<SyscallViolation>,
    max_rss_kb: u64,
    cpu_time: f64,
    context_switches: (u64, u64),
}

impl TraceReport {
    fn record_usage(&mut self, usage: &libc::rusage) {
        let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6;
        self.max_rss_kb = usage.ru_maxrss.max(0) as u64;
        self.cpu_time = seconds(usage.ru_utime) + seconds(usage.ru_stime);
        self.context_switches = (usage.ru_nvcsw.max(0) as u64, usage.ru_nivcsw.max(0) as u64);
    }
}

#[derive(Debug, Default)]
struct Task {
    in_syscall: bool,
    pending_errno: Option<i32>,
}

fn wait4(target: i32) -> std::result::Result<(WaitStatus, libc::rusage), Errno> {
    let mut status = 0;
    // SAFETY: rusage is plain data
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: both out-pointers are valid for the duration of the call
    let rc = unsafe { libc::wait4(target, &mut status, libc::__WALL, &mut usage) };
    if rc < 0 {
        return Err(Errno::last());
    }
    Ok((WaitStatus::from_raw(Pid::from_raw(rc), status)?, usage))
}

/// Resume a stopped task; a task that died in the meantime is not an error.
fn resume(tid: Pid, signal: Option<Signal>) -> Result<()> {
    match ptrace::syscall(tid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

fn trace(pid: Pid, policy: &SyscallPolicy, killer: &ProcessKiller) -> Result<TraceReport> {
    let mut report = TraceReport::default();

    loop {
        match wait4(pid.as_raw()) {
            Ok((WaitStatus::Stopped(_, Signal::SIGSTOP), _)) => break,
            Ok((WaitStatus::Exited(_, code), usage)) => {
                report.exit_code = Some(code);
                report.record_usage(&usage);
                return Ok(report);
            }
            Ok((WaitStatus::Signaled(_, signal, _), usage)) => {
                report.signal = Some(signal as i32);
                report.record_usage(&usage);
                return Ok(report);
            }
            Ok((other, _)) => {
                killer.kill();
                return Err(JudgeError::Sandbox(format!("unexpected initial stop: {:?}", other)));
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }

    if let Err(errno) = ptrace::setoptions(pid, options()) {
        killer.kill();
        return Err(JudgeError::Sandbox(format!("PTRACE_SETOPTIONS failed: {}", errno)));
    }
    resume(pid, None)?;

    let mut tasks: HashMap<Pid, Task> = HashMap::new();
    tasks.insert(pid, Task::default());
    let mut exec_seen = false;

    loop {
        let (status, usage) = match wait4(-pid.as_raw()) {
            Ok(event) => event,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(errno) => {
                killer.kill();
                return Err(errno.into());
            }
        };

        match status {
            WaitStatus::PtraceSyscall(tid) => {
                let task = tasks.entry(tid).or_default();
                if task.in_syscall {
                    task.in_syscall = false;
                    if let Some(errno) = task.pending_errno.take() {
                        if let Err(err) = set_return_value(tid, -(errno as i64)) {
                            log::debug!("cannot set return value on task {}: {}", tid, err);
                        }
                    }
                    resume(tid, None)?;
                    continue;
                }

                task.in_syscall = true;
                let allow_exec = tid == pid && !exec_seen;
                match syscall_entry(tid, policy, allow_exec) {
                    Entry::Allow => resume(tid, None)?,
                    Entry::Emulate(errno) => {
                        skip_syscall(tid)?;
                        task.pending_errno = Some(errno);
                        resume(tid, None)?;
                    }
                    Entry::Kill(violation) => {
                        // A stopped tracee dies on SIGKILL without being resumed.
                        report.violation.get_or_insert(violation);
                        killer.kill();
                    }
                }
            }
            WaitStatus::PtraceEvent(tid, _, event) => {
                if tid == pid && event == Event::PTRACE_EVENT_EXEC as i32 {
                    exec_seen = true;
                }
                resume(tid, None)?;
            }
            WaitStatus::Stopped(tid, signal) => {
                if !tasks.contains_key(&tid) && signal == Signal::SIGSTOP {
                    // Initial stop of a freshly traced thread or child
                    tasks.insert(tid, Task::default());
                    resume(tid, None)?;
                } else {
                    tasks.entry(tid).or_default();
                    resume(tid, Some(signal))?;
                }
            }
            WaitStatus::Exited(tid, code) => {
                tasks.remove(&tid);
                if tid == pid {
                    report.exit_code = Some(code);
                    report.record_usage(&usage);
                    if !tasks.is_empty() {
                        killer.kill();
                    }
                }
            }
            WaitStatus::Signaled(tid, signal, _) => {
                tasks.remove(&tid);
                if tid == pid {
                    report.signal = Some(signal as i32);
                    report.record_usage(&usage);
                    if !tasks.is_empty() {
                        killer.kill();
                    }
                }
            }
            _ => {}
        }
    }

    Ok(report)
}

enum Entry {
    Allow,
    Emulate(i32),
    Kill(SyscallViolation),
}

fn syscall_entry(tid: Pid, policy: &SyscallPolicy, allow_exec: bool) -> Entry {
    match inspect(tid, policy, allow_exec) {
        Ok(entry) => entry,
        Err(err) => Entry::Kill(SyscallViolation {
            abi: Abi::native().unwrap_or(Abi::X64),
            number: 0,
            name: None,
            kind: ViolationKind::Fault,
            detail: Some(format!("cannot inspect syscall: {}", err)),
        }),
    }
}

fn inspect(tid: Pid, policy: &SyscallPolicy, allow_exec: bool) -> Result<Entry> {
    let regs = read_registers(tid)?;
    let abi = Abi::detect_entry(&regs, entry_gate(tid));
    let frame = abi
        .backend()
        .decode(&regs)
        .ok_or_else(|| JudgeError::Sandbox(format!("registers do not match {}", abi)))?;
    if allow_exec && abi.backend().syscall_name(frame.number) == Some("execve") {
        return Ok(Entry::Allow);
    }

    let verdict = policy.decide(&frame, &PtraceMemory::new(tid));
    Ok(match verdict.decision {
        Decision::Allow => Entry::Allow,
        Decision::Emulate(errno) => Entry::Emulate(errno),
        Decision::Deny(Violation { kind, detail }) => {
            let name = verdict.name.unwrap_or("unknown");
            match kind {
                ViolationKind::Disallowed => audit::syscall_denied(tid.as_raw(), name, detail.as_deref()),
                ViolationKind::Fault => log::debug!("{} on task {} faulted: {:?}", name, tid, detail),
            }
            Entry::Kill(SyscallViolation {
                abi: verdict.abi,
                number: verdict.number,
                name: verdict.name.map(str::to_string),
                kind,
                detail,
            })
        }
    })
}
