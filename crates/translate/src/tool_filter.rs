//! Tool-call detection seam
//!
//! Detection itself lives outside this workspace. The translator only drives
//! a filter through its two calls and shapes the terminal frame from what
//! `finalize` returns.

use crate::wire::{ChatRequest, ToolCall};

/// Streaming detector fed the answer chunk by chunk.
pub trait ToolCallFilter: Send {
    /// Returns whether a tool-call trigger was seen in this chunk, and the
    /// text that should still reach the client.
    fn process_chunk(&mut self, text: &str) -> (bool, String);

    /// Called once after the last chunk. Non-empty calls replace the normal
    /// stop frame with a tool-call frame.
    fn finalize(&mut self) -> (Vec<ToolCall>, String);
}

/// Creates one filter per request that opted into tool calling.
pub trait ToolFilterFactory: Send + Sync {
    fn create(&self, request: &ChatRequest) -> Option<Box<dyn ToolCallFilter>>;
}
