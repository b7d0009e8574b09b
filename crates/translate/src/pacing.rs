//! Simulated streaming
//!
//! The whole answer is already in hand, so "streaming" means slicing it into
//! chunks sized to fit the duration budget and writing them to the response
//! channel with a fixed delay in between. A closed channel means the client
//! went away; every emission point checks for it and stops.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::tool_filter::ToolCallFilter;
use crate::wire::{ChunkFactory, DONE_FRAME, sse_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    /// Pause between content frames
    pub delay: Duration,
    /// Upper bound on the total paced duration
    pub max_duration: Duration,
    pub default_chunk_size: usize,
    pub min_chunk_size: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            max_duration: Duration::from_secs(10),
            default_chunk_size: 50,
            min_chunk_size: 50,
        }
    }
}

impl PacingConfig {
    /// Characters per frame for an answer of `len` characters.
    ///
    /// `ceil(len * delay / max_duration)`, raised to `min_chunk_size`; when
    /// that exceeds the answer itself, `min(default_chunk_size, len)`.
    pub fn chunk_size(&self, len: usize) -> usize {
        if len == 0 {
            return self.default_chunk_size;
        }
        let budget = self.max_duration.as_micros().max(1);
        let raw = (len as u128 * self.delay.as_micros()).div_ceil(budget);
        let size = usize::try_from(raw)
            .unwrap_or(usize::MAX)
            .max(self.min_chunk_size);
        if size > len {
            self.default_chunk_size.min(len)
        } else {
            size
        }
    }
}

/// Split on character boundaries into pieces of `size` characters; the last
/// piece may be shorter.
pub fn split_chunks(text: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == size {
            pieces.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("client disconnected")]
    Disconnected,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writes SSE frames for one response into the body channel.
pub struct FrameSink {
    tx: mpsc::Sender<String>,
    chunks: ChunkFactory,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<String>, chunks: ChunkFactory) -> Self {
        Self { tx, chunks }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send<T: Serialize>(&self, value: &T) -> Result<(), EmitError> {
        self.send_raw(sse_frame(value)?).await
    }

    async fn send_raw(&self, frame: String) -> Result<(), EmitError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| EmitError::Disconnected)
    }

    async fn pause(&self, delay: Duration) -> Result<(), EmitError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.tx.closed() => Err(EmitError::Disconnected),
        }
    }

    /// Opening `role: assistant` frame.
    pub async fn role(&self) -> Result<(), EmitError> {
        self.send(&self.chunks.role()).await
    }

    /// Pace `text` out as content frames, then close the stream with a stop
    /// (or tool-call) frame and `[DONE]`.
    pub async fn stream_answer(
        &self,
        text: &str,
        pacing: &PacingConfig,
        mut filter: Option<Box<dyn ToolCallFilter>>,
    ) -> Result<(), EmitError> {
        let size = pacing.chunk_size(text.chars().count());
        let pieces = split_chunks(text, size);
        debug!(chars = text.len(), chunk_size = size, frames = pieces.len(), "pacing answer");

        for (i, piece) in pieces.iter().enumerate() {
            if i > 0 {
                self.pause(pacing.delay).await?;
            }
            let out = match filter.as_mut() {
                Some(filter) => {
                    let (triggered, passthrough) = filter.process_chunk(piece);
                    if triggered {
                        debug!("tool call trigger detected");
                    }
                    passthrough
                }
                None => (*piece).to_string(),
            };
            if !out.is_empty() {
                self.send(&self.chunks.content(out)).await?;
            }
        }

        let calls = match filter.as_mut() {
            Some(filter) => {
                let (calls, remaining) = filter.finalize();
                if !remaining.is_empty() {
                    self.send(&self.chunks.content(remaining)).await?;
                }
                calls
            }
            None => Vec::new(),
        };

        if calls.is_empty() {
            self.send(&self.chunks.finish("stop")).await?;
        } else {
            debug!(calls = calls.len(), "emitting tool calls");
            self.send(&self.chunks.tool_calls(calls)).await?;
            self.send(&self.chunks.finish("tool_calls")).await?;
        }
        self.send_raw(DONE_FRAME.to_string()).await
    }

    /// In-band failure: message frame, `finish_reason: "error"`, `[DONE]`.
    pub async fn stream_error(&self, message: &str) -> Result<(), EmitError> {
        self.send(&self.chunks.content(format!("\n\n{message}")))
            .await?;
        self.send(&self.chunks.finish("error")).await?;
        self.send_raw(DONE_FRAME.to_string()).await
    }
}
