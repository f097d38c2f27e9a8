//! Logging setup

pub mod setup;
