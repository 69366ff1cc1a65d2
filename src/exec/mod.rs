//! Launching untrusted processes
//!
//! [`process::TracedProcess`] is the public face; the Linux tracer behind it
//! forks, applies [`limits::LaunchLimits`] and answers every syscall stop
//! from a [`crate::sandbox::SyscallPolicy`].

pub mod limits;
pub mod output;
pub mod process;
#[cfg(target_os = "linux")]
mod tracer;

pub use limits::LaunchLimits;
pub use process::{LaunchRequest, ProcessKiller, ProcessOutcome, SyscallViolation, TracedProcess};
