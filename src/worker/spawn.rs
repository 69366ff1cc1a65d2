//! Starting workers.
//!
//! [`ProcessSpawner`] re-execs the judge binary in its hidden worker role;
//! [`ThreadSpawner`] runs a worker body on a thread in this process, which is
//! what tests and embedders without a binary use.

use crate::config::types::{JudgeError, Result};
use log::debug;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Descriptor the worker finds its channel on
pub const WORKER_IPC_FD: i32 = 3;

/// Control over a started worker
pub trait WorkerProcessHandle: Send {
    /// Stop the worker without waiting for it
    fn kill(&mut self) -> Result<()>;

    /// Wait up to `timeout`; true once the worker is gone
    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool>;
}

/// The judge's end of a freshly started worker
pub struct SpawnedWorker {
    pub channel: UnixStream,
    pub process: Box<dyn WorkerProcessHandle>,
}

pub trait WorkerSpawner: Send + Sync {
    /// `label` names the submission in logs and thread names
    fn spawn(&self, label: &str) -> Result<SpawnedWorker>;
}

/// Runs `<executable> --internal-role worker --ipc-fd 3`
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    executable: PathBuf,
    log_level: String,
}

impl ProcessSpawner {
    pub fn new(executable: impl Into<PathBuf>, log_level: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            log_level: log_level.into(),
        }
    }

    /// Re-exec whatever binary is running now
    pub fn current_exe(log_level: impl Into<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, log_level))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, label: &str) -> Result<SpawnedWorker> {
        let (parent, child) = UnixStream::pair()?;
        let child_fd = child.as_raw_fd();

        let mut command = Command::new(&self.executable);
        command
            .args(["--internal-role", "worker", "--ipc-fd"])
            .arg(WORKER_IPC_FD.to_string())
            .args(["--log-level", &self.log_level])
            .stdin(Stdio::null());
        // SAFETY: only dup2/fcntl run between fork and exec; both are
        // async-signal-safe. `child` stays open in the parent until spawn returns.
        unsafe {
            command.pre_exec(move || {
                if child_fd == WORKER_IPC_FD {
                    let flags = libc::fcntl(child_fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, WORKER_IPC_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let process = command
            .spawn()
            .map_err(|e| JudgeError::Ipc(format!("failed to start worker for {}: {}", label, e)))?;
        drop(child);
        debug!("worker for {} started as pid {}", label, process.id());
        Ok(SpawnedWorker {
            channel: parent,
            process: Box::new(ChildHandle { child: process }),
        })
    }
}

struct ChildHandle {
    child: Child,
}

impl WorkerProcessHandle for ChildHandle {
    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                debug!("worker {} exited with {}", self.child.id(), status);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

type WorkerBody = dyn Fn(UnixStream) + Send + Sync;

/// Runs a worker body on a thread of this process
#[derive(Clone)]
pub struct ThreadSpawner {
    body: Arc<WorkerBody>,
}

impl ThreadSpawner {
    pub fn new(body: impl Fn(UnixStream) + Send + Sync + 'static) -> Self {
        Self { body: Arc::new(body) }
    }

    /// Workers running the real worker loop
    pub fn serving() -> Self {
        Self::new(|stream| {
            if let Err(e) = super::handler::serve(stream) {
                log::error!("in-process worker failed: {}", e);
            }
        })
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, label: &str) -> Result<SpawnedWorker> {
        let (parent, child) = UnixStream::pair()?;
        let control = child.try_clone()?;
        let body = self.body.clone();
        let thread = thread::Builder::new()
            .name(format!("worker-{}", label))
            .spawn(move || body(child))?;
        Ok(SpawnedWorker {
            channel: parent,
            process: Box::new(ThreadHandle {
                control,
                thread: Some(thread),
            }),
        })
    }
}

struct ThreadHandle {
    control: UnixStream,
    thread: Option<JoinHandle<()>>,
}

impl WorkerProcessHandle for ThreadHandle {
    /// A thread cannot be killed; cutting its channel makes it wind down
    fn kill(&mut self) -> Result<()> {
        let _ = self.control.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.thread.as_ref().map_or(true, JoinHandle::is_finished) {
                if let Some(handle) = self.thread.take() {
                    let _ = handle.join();
                }
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}
