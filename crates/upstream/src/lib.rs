//! Upstream abstraction for the K2Think chat API
//!
//! Defines the `Upstream` trait the retry orchestrator drives. One call sends
//! one fully-built payload with one pool credential and returns the whole
//! answer; streaming to the client is simulated downstream, so the upstream
//! is always asked for a non-streaming reply.

pub mod k2think;
pub mod payload;

pub use k2think::K2ThinkClient;
pub use payload::{UpstreamMessage, UpstreamPayload, build_payload, upstream_model};

use std::future::Future;
use std::pin::Pin;

use translate::Usage;

/// One complete upstream answer, tags still in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamAnswer {
    pub content: String,
    pub usage: Option<Usage>,
}

/// Errors from a single upstream call.
///
/// The `Display` output is what the token pool classifies, so non-2xx answers
/// render as `upstream error: <status>: <body>`.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream error: {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream timeout after {0}s")]
    Timeout(u64),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("failed to encode upstream payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }
}

/// Result alias for upstream calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "k2think")
    fn id(&self) -> &str;

    /// Send `payload` authenticated with `credential` and wait for the answer.
    fn complete<'a>(
        &'a self,
        payload: &'a UpstreamPayload,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamAnswer>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_is_classifiable() {
        let err = UpstreamError::Status {
            status: 401,
            body: "{\"detail\":\"Not authenticated\"}".into(),
        };
        assert_eq!(
            err.to_string(),
            "upstream error: 401: {\"detail\":\"Not authenticated\"}"
        );
        assert!(!err.is_timeout());
        assert!(UpstreamError::Timeout(60).is_timeout());
    }
}
