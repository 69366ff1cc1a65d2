//! Syscall and filesystem policy applied to traced processes.
//!
//! [`filesystem`] classifies paths, [`policy`] maps syscall names to
//! handlers, and [`isolate`] ties the two together for path-bearing calls.
//! [`guards`] confines calls that can reach other processes.

pub mod filesystem;
pub mod guards;
pub mod isolate;
pub mod policy;

pub use filesystem::{Filesystem, FilesystemAccessRule, FilesystemPolicy};
pub use isolate::IsolateTracer;
pub use policy::{Decision, Handler, SyscallContext, SyscallPolicy, TraceeMemory, Violation, ViolationKind};
