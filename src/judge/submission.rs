use crate::problem::SubmissionMeta;
use serde::{Deserialize, Serialize};

/// One submission as requested by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: u64,
    pub problem_id: String,
    pub language: String,
    pub source: String,
    /// Seconds
    pub time_limit: f64,
    /// KB
    pub memory_limit: u64,
    pub short_circuit: bool,
    pub meta: SubmissionMeta,
}

impl Submission {
    /// Seconds the judge waits for the worker's next message
    pub fn receive_timeout(&self) -> u64 {
        let doubled = (2.0 * self.time_limit).max(0.0) as u64;
        doubled.max(60)
    }
}
