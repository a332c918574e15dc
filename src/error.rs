//! Error types for Floodgate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Floodgate operations.
///
/// Only construction and configuration problems surface through this type at
/// the orchestrator boundary. Store failures are absorbed by the circuit
/// breaker and reported as [`LimitState::LimitApplicationFailed`].
///
/// [`LimitState::LimitApplicationFailed`]: crate::ratelimit::LimitState::LimitApplicationFailed
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid rate or policy parameters
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// The same policy identity was registered twice
    #[error("Duplicate policy registration for {0}")]
    DuplicatePolicy(String),

    /// The selected window algorithm cannot enforce this kind of rate
    #[error("The {algorithm} algorithm does not support {unit} rates")]
    UnsupportedRate {
        algorithm: &'static str,
        unit: String,
    },

    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
