//! Seams between the pool and its collaborators
//!
//! The pool never logs in by itself. It asks a `CredentialSource` for a fresh
//! credential list and signals a `RefreshTrigger` when its failure counters say
//! the current generation is stale.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// Boxed future returned by `CredentialSource::refresh`.
pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

/// Produces a complete replacement set of upstream credentials.
///
/// An error or an empty list both mean "no update"; the pool keeps its current
/// generation in either case.
pub trait CredentialSource: Send + Sync {
    /// Identifier for logging (e.g. "k2think-login")
    fn name(&self) -> &str;

    fn refresh(&self) -> RefreshFuture<'_>;
}

/// Fire-and-forget request for an out-of-band pool refresh.
///
/// Implementations must return immediately; the refresh itself runs on its own
/// task so the request that noticed the failure is never stalled by a login.
pub trait RefreshTrigger: Send + Sync {
    fn trigger(&self, reason: &'static str);
}
