//! Upstream failure classification
//!
//! Separates credential problems (401/403-class answers from K2Think) from
//! everything else. Credential problems drive the pool-wide refresh logic;
//! everything else only counts against the individual token.

use std::sync::LazyLock;

use regex::Regex;

/// Case-insensitive markers of a credential-related upstream failure.
const AUTH_ERROR_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid token",
    "token expired",
    "authentication failed",
    "authentication error",
    "authentication_error",
];

/// `<prefix>: 401` / `<prefix>: 403` as rendered by the upstream client.
static STATUS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:upstream error|http status error|status code):\s*40[13]\b")
        .expect("status pattern is a valid regex")
});

/// Whether an error message describes an upstream authentication/authorization
/// failure rather than a generic network or server error.
pub fn is_upstream_auth_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_ERROR_MARKERS.iter().any(|m| lower.contains(m)) || STATUS_PATTERN.is_match(message)
}

/// A literal `401` skips the consecutive-error threshold entirely.
pub fn demands_immediate_refresh(message: &str) -> bool {
    message.contains("401")
}
