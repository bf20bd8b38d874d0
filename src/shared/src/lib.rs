//! Shared types and utilities for the Atlas service broker

pub mod config;
pub mod types;

pub use config::{LogFormat, LoggingConfig, ServerConfig};

pub use types::*;
