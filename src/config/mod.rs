//! Configuration
//!
//! Judge configuration types, YAML loading with command-line overrides, and
//! startup validation.

pub mod loader;
pub mod types;
pub mod validator;
