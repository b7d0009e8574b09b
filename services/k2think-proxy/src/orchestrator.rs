//! Retry orchestration
//!
//! Drives one chat request through the token pool and the upstream: pick a
//! credential, attempt the call, report the outcome back to the pool, and
//! either translate the answer or try again with the next credential.
//!
//! Streaming requests run the same attempt loop inside a spawned task after
//! the `role` frame is out, so failures there are reported in-band.

use std::sync::Arc;
use std::time::Duration;

use token_pool::{TokenPool, is_upstream_auth_error};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, warn};
use translate::{
    ChatCompletion, ChatRequest, ChunkFactory, EmitError, FrameSink, PacingConfig, ThinkingMode,
    ToolCallFilter, ToolFilterFactory, Usage, completion, extract_answer,
};
use upstream::{Upstream, UpstreamAnswer, UpstreamError, UpstreamPayload, build_payload};

use crate::error::ProxyError;
use crate::metrics::record_attempt;

/// Shown instead of an error when the first attempt hits a 401/403-class
/// failure; the pool has already been told to refresh.
pub const REFRESH_PENDING_MESSAGE: &str =
    "\u{1f504} Token refresh started, please retry shortly.";

/// Token estimate reported alongside the refresh placeholder.
pub const PLACEHOLDER_USAGE: Usage = Usage {
    prompt_tokens: 0,
    completion_tokens: 10,
    total_tokens: 10,
};

/// Frames buffered between the stream task and the response body.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

enum Outcome {
    Answer(UpstreamAnswer),
    /// First attempt failed on credentials; a pool refresh is under way.
    RefreshPending,
    /// The streaming client went away between attempts.
    Abandoned,
}

pub struct Orchestrator {
    pool: Arc<TokenPool>,
    upstream: Arc<dyn Upstream>,
    policy: RetryPolicy,
    pacing: PacingConfig,
    tool_filters: Option<Arc<dyn ToolFilterFactory>>,
}

impl Orchestrator {
    /// `tool_filters` is the tool-call detector used for requests that carry
    /// `tools`; without one those requests get plain text replies.
    pub fn new(
        pool: Arc<TokenPool>,
        upstream: Arc<dyn Upstream>,
        policy: RetryPolicy,
        pacing: PacingConfig,
        tool_filters: Option<Arc<dyn ToolFilterFactory>>,
    ) -> Self {
        Self {
            pool,
            upstream,
            policy,
            pacing,
            tool_filters,
        }
    }

    fn tool_filter(&self, request: &ChatRequest) -> Option<Box<dyn ToolCallFilter>> {
        let wants_tools = request.tools.as_ref().is_some_and(|t| !t.is_empty());
        if !wants_tools {
            return None;
        }
        self.tool_filters.as_ref()?.create(request)
    }

    /// Non-streaming completion.
    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, ProxyError> {
        let payload = build_payload(request);
        match self.attempt_all(&payload, None, || false).await? {
            Outcome::Answer(answer) => {
                let text = extract_answer(&answer.content, ThinkingMode::for_model(&request.model));
                Ok(completion(
                    &request.model,
                    text,
                    answer.usage.unwrap_or_default(),
                    self.tool_filter(request),
                ))
            }
            Outcome::RefreshPending => Ok(completion(
                &request.model,
                REFRESH_PENDING_MESSAGE.to_string(),
                PLACEHOLDER_USAGE,
                None,
            )),
            Outcome::Abandoned => Err(ProxyError::Upstream("request abandoned".into())),
        }
    }

    /// Start a streaming completion and return the SSE frame receiver.
    ///
    /// The first credential is taken before the response starts so an empty
    /// pool is still a plain 503. Dropping the receiver stops the stream.
    pub async fn stream(
        self: &Arc<Self>,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<String>, ProxyError> {
        let first = self
            .pool
            .next_token()
            .await
            .ok_or(ProxyError::NoCredentialAvailable)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(
            async move {
                let sink = FrameSink::new(tx, ChunkFactory::new(request.model.clone()));
                match this.drive_stream(&request, first, &sink).await {
                    Ok(()) => debug!("stream finished"),
                    Err(EmitError::Disconnected) => info!("client disconnected mid-stream"),
                    Err(e) => warn!(error = %e, "failed to emit stream frame"),
                }
            }
            .in_current_span(),
        );
        Ok(rx)
    }

    async fn drive_stream(
        &self,
        request: &ChatRequest,
        first: String,
        sink: &FrameSink,
    ) -> Result<(), EmitError> {
        sink.role().await?;

        let payload = build_payload(request);
        match self
            .attempt_all(&payload, Some(first), || sink.is_closed())
            .await
        {
            Ok(Outcome::Answer(answer)) => {
                let text = extract_answer(&answer.content, ThinkingMode::for_model(&request.model));
                sink.stream_answer(&text, &self.pacing, self.tool_filter(request))
                    .await
            }
            Ok(Outcome::RefreshPending) => sink.stream_error(REFRESH_PENDING_MESSAGE).await,
            Ok(Outcome::Abandoned) => Err(EmitError::Disconnected),
            Err(e) => {
                warn!(error = %e, "streaming request failed");
                sink.stream_error(&format!("Request failed: {e}")).await
            }
        }
    }

    /// The attempt loop shared by both modes. `first` is a credential the
    /// caller already took from the pool for attempt 1. `abandoned` is polled
    /// before every retry.
    async fn attempt_all(
        &self,
        payload: &UpstreamPayload,
        mut first: Option<String>,
        abandoned: impl Fn() -> bool,
    ) -> Result<Outcome, ProxyError> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 && abandoned() {
                debug!(attempt, "client gone, skipping remaining attempts");
                return Ok(Outcome::Abandoned);
            }

            let credential = match first.take() {
                Some(credential) => credential,
                None => self
                    .pool
                    .next_token()
                    .await
                    .ok_or(ProxyError::NoCredentialAvailable)?,
            };

            let err = match self.upstream.complete(payload, &credential).await {
                Ok(answer) => {
                    record_attempt("success");
                    self.pool.mark_success(&credential).await;
                    debug!(attempt, upstream = self.upstream.id(), "upstream call succeeded");
                    return Ok(Outcome::Answer(answer));
                }
                Err(err) => err,
            };

            // the payload is the same on every attempt, so encoding errors are final
            if let UpstreamError::Serialization(e) = &err {
                record_attempt("error");
                return Err(ProxyError::Serialization(e.to_string()));
            }

            let message = err.to_string();
            let auth = is_upstream_auth_error(&message);
            record_attempt(if auth {
                "auth_error"
            } else if err.is_timeout() {
                "timeout"
            } else {
                "error"
            });
            warn!(attempt, auth, error = %message, "upstream attempt failed");
            self.pool.mark_failure(&credential, &message).await;

            if attempt == 1 && auth {
                info!("credential rejected on first attempt, answering with refresh notice");
                return Ok(Outcome::RefreshPending);
            }

            last_error = Some((err, auth));
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        Err(match last_error {
            Some((err, _)) if err.is_timeout() => ProxyError::Timeout(err.to_string()),
            Some((err, true)) => ProxyError::UpstreamAuth(err.to_string()),
            Some((err, false)) => ProxyError::Upstream(err.to_string()),
            None => ProxyError::NoCredentialAvailable,
        })
    }
}
