pub mod build_output;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod error;
pub mod focus;
pub mod isa_csv;
pub mod log_sanitize;
pub mod logging;
pub mod orchestrator;
pub mod project;
pub mod session;
pub mod session_metadata;
pub mod workspace;

pub use error::{Error, Result};
