//! Relaygate Core Library
//!
//! This crate provides the shared pieces of the Relaygate reverse proxy:
//! environment-driven configuration and common error handling.

pub mod config;
pub mod error;

pub use config::{ProxyConfig, RunEnv};
pub use error::{Error, Result};

/// Relaygate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
