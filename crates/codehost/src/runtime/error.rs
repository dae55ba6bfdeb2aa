//! Runtime driver error types.

use thiserror::Error;

/// Result type for runtime driver operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while driving the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse runtime output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
