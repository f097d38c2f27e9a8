//! # Infrastructure Common
//!
//! Shared infrastructure for the rvoip call-control services.
//!
//! - [`errors`]: common error type and context helpers
//! - [`logging`]: `tracing` subscriber setup
//! - [`config`]: layered configuration loading (defaults, file, environment)
//! - [`tasks`]: tracked task spawning with cancellation

pub mod errors;
pub mod logging;
pub mod config;
pub mod tasks;

pub use errors::types::{Error, Result};
pub use errors::context::{ErrorContext, ErrorExt};
pub use logging::setup::{setup_logging, LoggingConfig};
pub use tasks::{TaskManager, TaskStats};
