//! Error types for account login

/// Errors from loading accounts and signing in.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("sign-in rejected: {0}")]
    Rejected(String),

    #[error("sign-in succeeded without a token cookie")]
    MissingToken,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for login operations.
pub type Result<T> = std::result::Result<T, Error>;
