//! Upstream answer → OpenAI chat-completion translation
//!
//! K2Think answers arrive whole. This crate turns one answer into either a
//! single `chat.completion` object or a paced sequence of
//! `chat.completion.chunk` SSE frames, after stripping the reasoning/answer
//! tags according to the requested model.

pub mod pacing;
pub mod tags;
pub mod tool_filter;
pub mod wire;

pub use pacing::{EmitError, FrameSink, PacingConfig, split_chunks};
pub use tags::{ThinkingMode, extract_answer};
pub use tool_filter::{ToolCallFilter, ToolFilterFactory};
pub use wire::{
    ChatCompletion, ChatMessage, ChatRequest, ChunkFactory, DONE_FRAME, FunctionCall,
    MODEL_ID, MODEL_ID_NOTHINK, MODEL_OWNER, MODEL_ROOT, ToolCall, Usage, completion, sse_frame,
};
