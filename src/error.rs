//! Error types for Brute Guard.

use thiserror::Error;

pub use crate::guard::store::StoreError;

/// Main error type for Brute Guard operations.
#[derive(Error, Debug)]
pub enum BruteGuardError {
    /// Invalid delay bounds or policy values, raised at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The attempt store could not serve a request
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for Brute Guard operations.
pub type Result<T> = std::result::Result<T, BruteGuardError>;
