//! OpenAI-compatible wire types
//!
//! Request types are deliberately loose (`serde_json::Value` for message
//! content and tools) because clients send every shape the OpenAI API has
//! ever accepted. Response types are strict so the emitted JSON is stable.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool_filter::ToolCallFilter;

pub const MODEL_ID: &str = "MBZUAI-IFM/K2-Think";
pub const MODEL_ID_NOTHINK: &str = "MBZUAI-IFM/K2-Think-nothink";
pub const MODEL_OWNER: &str = "MBZUAI";
pub const MODEL_ROOT: &str = "mbzuai-k2-think-2508";

/// Stream terminator.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
}

fn default_model() -> String {
    MODEL_ID.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// String, array of content parts, or null
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Build the non-streaming reply for an already tag-processed answer.
///
/// With a tool filter, the whole text runs through one `process_chunk` and
/// `finalize`; parsed calls switch the reply to `finish_reason: "tool_calls"`.
pub fn completion(
    model: &str,
    text: String,
    usage: Usage,
    filter: Option<Box<dyn ToolCallFilter>>,
) -> ChatCompletion {
    let (content, tool_calls) = match filter {
        Some(mut filter) => {
            let (_, passthrough) = filter.process_chunk(&text);
            let (calls, remaining) = filter.finalize();
            let content = passthrough + &remaining;
            if calls.is_empty() {
                (Some(content), None)
            } else {
                ((!content.is_empty()).then_some(content), Some(calls))
            }
        }
        None => (Some(text), None),
    };

    let finish_reason = if tool_calls.is_some() {
        "tool_calls"
    } else {
        "stop"
    };

    ChatCompletion {
        id: format!("chatcmpl-{}", unix_millis()),
        object: "chat.completion",
        created: unix_secs(),
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
                tool_calls,
            },
            finish_reason,
        }],
        usage,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StreamToolCall>>,
}

/// Tool call as it appears inside a streaming delta.
#[derive(Debug, Clone, Serialize)]
pub struct StreamToolCall {
    pub index: usize,
    #[serde(flatten)]
    pub call: ToolCall,
}

/// Stamps chunk frames for one response.
#[derive(Debug, Clone)]
pub struct ChunkFactory {
    model: String,
}

impl ChunkFactory {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatChunk {
        ChatChunk {
            id: format!("chatcmpl-{}", unix_millis()),
            object: "chat.completion.chunk",
            created: unix_secs(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Opening frame: `{"role":"assistant","content":""}`.
    pub fn role(&self) -> ChatChunk {
        self.chunk(
            Delta {
                role: Some("assistant"),
                content: Some(String::new()),
                tool_calls: None,
            },
            None,
        )
    }

    pub fn content(&self, text: impl Into<String>) -> ChatChunk {
        self.chunk(
            Delta {
                content: Some(text.into()),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn tool_calls(&self, calls: Vec<ToolCall>) -> ChatChunk {
        let calls = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| StreamToolCall { index, call })
            .collect();
        self.chunk(
            Delta {
                tool_calls: Some(calls),
                ..Delta::default()
            },
            None,
        )
    }

    /// Terminal frame with an empty delta.
    pub fn finish(&self, reason: &'static str) -> ChatChunk {
        self.chunk(Delta::default(), Some(reason))
    }
}

/// `data: <json>\n\n`
pub fn sse_frame<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(value)?))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_accepts_string_and_part_content() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": MODEL_ID_NOTHINK,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "assistant"}
            ],
            "stream": true
        }))
        .unwrap();
        assert_eq!(req.model, MODEL_ID_NOTHINK);
        assert!(req.stream);
        assert!(req.messages[1].content.is_array());
        assert!(req.messages[2].content.is_null());
    }

    #[test]
    fn request_defaults() {
        let req: ChatRequest =
            serde_json::from_value(json!({"messages": [{"role": "user", "content": "x"}]}))
                .unwrap();
        assert_eq!(req.model, MODEL_ID);
        assert!(!req.stream);
        assert!(req.tools.is_none());
    }

    #[test]
    fn completion_shape() {
        let usage = Usage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
        };
        let value = serde_json::to_value(completion(MODEL_ID, "hello".into(), usage, None)).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert!(value["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(value["model"], MODEL_ID);
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
        assert!(value["choices"][0]["message"].get("tool_calls").is_none());
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["total_tokens"], 7);
    }

    #[test]
    fn role_chunk_and_terminal_chunk() {
        let chunks = ChunkFactory::new(MODEL_ID);
        let role = serde_json::to_value(chunks.role()).unwrap();
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"], json!({"role": "assistant", "content": ""}));
        assert!(role["choices"][0]["finish_reason"].is_null());

        let stop = serde_json::to_value(chunks.finish("stop")).unwrap();
        assert_eq!(stop["choices"][0]["delta"], json!({}));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn tool_call_chunk_carries_indices() {
        let chunks = ChunkFactory::new(MODEL_ID);
        let call = ToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "lookup".into(),
                arguments: "{\"q\":\"x\"}".into(),
            },
        };
        let value = serde_json::to_value(chunks.tool_calls(vec![call])).unwrap();
        let tc = &value["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(tc["index"], 0);
        assert_eq!(tc["id"], "call_1");
        assert_eq!(tc["type"], "function");
        assert_eq!(tc["function"]["name"], "lookup");
    }

    #[test]
    fn frame_format() {
        let frame = sse_frame(&json!({"a": 1})).unwrap();
        assert_eq!(frame, "data: {\"a\":1}\n\n");
        assert_eq!(DONE_FRAME, "data: [DONE]\n\n");
    }
}
