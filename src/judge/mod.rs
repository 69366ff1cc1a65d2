//! Judge orchestration.
//!
//! A judge grades at most one submission at a time. It reads packets from
//! the server, starts a worker per submission and relays the worker's
//! progress back as packets.

pub mod orchestrator;
pub mod submission;

pub use orchestrator::{packet_for, Judge};
pub use submission::Submission;
