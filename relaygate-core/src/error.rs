//! Error types for Relaygate
//!
//! The worker crates each carry their own error enums close to the code
//! that raises them; what lives here is only what the shared configuration
//! layer needs.

use thiserror::Error;

/// Result type for Relaygate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the shared configuration layer
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
