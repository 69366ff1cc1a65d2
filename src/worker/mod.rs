//! Per-submission worker processes.
//!
//! The judge starts one worker per submission ([`spawn`]), hands it a
//! [`GradeRequest`] and drains its [`IpcMessage`]s ([`client`]). The worker
//! side ([`handler`]) runs the grading loop and listens for aborts.

pub mod client;
pub mod handler;
pub mod ipc;
pub mod spawn;

pub use client::{JudgeWorker, WorkerAborter};
pub use handler::{grade_cases, grade_submission, run_worker_role, serve};
pub use ipc::{GradeRequest, IpcMessage, WorkerRequest, IPC_VERSION};
pub use spawn::{ProcessSpawner, SpawnedWorker, ThreadSpawner, WorkerProcessHandle, WorkerSpawner, WORKER_IPC_FD};
