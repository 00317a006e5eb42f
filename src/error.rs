//! Central error handling for the BVH builder.
//!
//! Build entry points report failures synchronously through `BuildError`;
//! no GPU work is recorded once a call has failed.

/// Centralized error type for all builder operations
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Convenience constructors for common error types
    pub fn invalid<T: ToString>(msg: T) -> Self {
        BuildError::InvalidArgument(msg.to_string())
    }

    pub fn internal<T: ToString>(msg: T) -> Self {
        BuildError::Internal(msg.to_string())
    }
}

/// Result type alias for builder operations
pub type BuildResult<T> = Result<T, BuildError>;
