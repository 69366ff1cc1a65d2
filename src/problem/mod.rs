//! Problem discovery and loading
//!
//! A problem is a directory with an `init.yml`. The store finds them, the
//! loader turns one into an ordered case sequence owned by [`Problem`].

pub mod loader;
pub mod store;
pub mod types;

pub use loader::{Problem, ProblemData, SubmissionMeta};
pub use store::ProblemStore;
pub use types::{BatchedTestCase, CaseConfig, CaseEntry, ProblemConfig, TestCase};
