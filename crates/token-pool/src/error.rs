//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token index {index} out of range (pool size {size})")]
    InvalidIndex { index: usize, size: usize },

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
