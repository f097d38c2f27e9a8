//! Error types shared across services

pub mod types;
pub mod context;
