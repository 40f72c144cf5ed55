//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the failure class is worth retrying (runtime hiccups,
    /// transient resource pressure) as opposed to a configuration problem.
    pub fn is_transient(&self) -> bool {
        match self {
            ContainerError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("timeout")
                    || lower.contains("temporarily")
                    || lower.contains("connection refused")
                    || lower.contains("cannot connect")
                    || lower.contains("resource temporarily unavailable")
            }
            ContainerError::Io(_) => true,
            _ => false,
        }
    }

    /// Whether the failure is a host port collision discovered at start.
    pub fn is_port_collision(&self) -> bool {
        match self {
            ContainerError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("port is already allocated")
                    || lower.contains("address already in use")
                    || lower.contains("bind for")
            }
            _ => false,
        }
    }
}
