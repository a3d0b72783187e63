//! Error types for planact.

use thiserror::Error;

/// Result type alias for planact operations.
pub type Result<T> = std::result::Result<T, PlanActError>;

/// Main error type for planact operations.
#[derive(Error, Debug)]
pub enum PlanActError {
    /// Malformed configuration, detected before any step runs.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A requested window does not fit in the corpus split.
    #[error("Insufficient data: requested a window of {requested} tokens from a split of {available}")]
    InsufficientData {
        /// Requested window length.
        requested: usize,
        /// Tokens available in the split.
        available: usize,
    },

    /// Array shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Model forward/backward errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PlanActError {
    /// Shorthand for a [`PlanActError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error is fatal before the run starts.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
