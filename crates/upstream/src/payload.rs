//! K2Think request payload
//!
//! The web app's chat endpoint expects a lot of session metadata alongside
//! the messages. Everything except the messages and model is fixed or
//! freshly generated per request.

use std::collections::BTreeMap;

use chrono::{FixedOffset, Offset, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use translate::{ChatRequest, MODEL_ID, MODEL_ID_NOTHINK, MODEL_OWNER, MODEL_ROOT};
use uuid::Uuid;

/// Template variables are rendered in China Standard Time.
const TEMPLATE_UTC_OFFSET_SECS: i32 = 8 * 3600;
const TEMPLATE_TIMEZONE: &str = "Asia/Shanghai";

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamPayload {
    pub stream: bool,
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub params: Map<String, Value>,
    pub tool_servers: Vec<Value>,
    pub features: Features,
    pub variables: BTreeMap<&'static str, String>,
    pub model_item: ModelItem,
    pub background_tasks: BackgroundTasks,
    pub chat_id: String,
    pub id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Features {
    pub image_generation: bool,
    pub code_interpreter: bool,
    pub web_search: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub root: &'static str,
    pub parent: Option<String>,
    pub status: &'static str,
    pub connection_type: &'static str,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTasks {
    pub title_generation: bool,
    pub tags_generation: bool,
}

/// The "nothink" alias only changes how the answer is rendered; upstream
/// always runs the base model.
pub fn upstream_model(requested: &str) -> &str {
    if requested == MODEL_ID_NOTHINK {
        MODEL_ID
    } else {
        requested
    }
}

pub fn build_payload(request: &ChatRequest) -> UpstreamPayload {
    let model = upstream_model(&request.model).to_string();
    let messages = request
        .messages
        .iter()
        .map(|m| UpstreamMessage {
            role: m.role.clone(),
            content: normalize_content(&m.content),
        })
        .collect();

    UpstreamPayload {
        stream: false,
        model: model.clone(),
        messages,
        params: Map::new(),
        tool_servers: Vec::new(),
        features: Features::default(),
        variables: template_variables(),
        model_item: ModelItem {
            id: model.clone(),
            object: "model",
            owned_by: MODEL_OWNER,
            root: MODEL_ROOT,
            parent: None,
            status: "active",
            connection_type: "external",
            name: model,
        },
        background_tasks: BackgroundTasks {
            title_generation: true,
            tags_generation: true,
        },
        chat_id: Uuid::new_v4().to_string(),
        id: Uuid::new_v4().to_string(),
        session_id: Uuid::new_v4().to_string(),
    }
}

/// Text-only part lists collapse to one space-joined string; lists carrying
/// an image stay as parts. Unknown part types are dropped.
fn normalize_content(content: &Value) -> Value {
    match content {
        Value::Null => Value::String(String::new()),
        Value::String(_) => content.clone(),
        Value::Array(parts) => {
            let mut has_image = false;
            let mut kept = Vec::new();
            for part in parts {
                match part {
                    Value::String(text) => kept.push(json!({"type": "text", "text": text})),
                    Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = obj
                                .get("text")
                                .and_then(Value::as_str)
                                .filter(|t| !t.is_empty())
                            {
                                kept.push(json!({"type": "text", "text": text}));
                            }
                        }
                        Some("image_url") => {
                            if let Some(image) = obj.get("image_url").filter(|v| !v.is_null()) {
                                has_image = true;
                                kept.push(json!({"type": "image_url", "image_url": image}));
                            }
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }

            if has_image {
                Value::Array(kept)
            } else {
                let texts: Vec<&str> = kept
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect();
                Value::String(texts.join(" "))
            }
        }
        other => Value::String(other.to_string()),
    }
}

fn template_variables() -> BTreeMap<&'static str, String> {
    let tz = FixedOffset::east_opt(TEMPLATE_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    let now = Utc::now().with_timezone(&tz);

    BTreeMap::from([
        ("{{USER_NAME}}", "User".to_string()),
        ("{{USER_LOCATION}}", "Unknown".to_string()),
        ("{{USER_LANGUAGE}}", "en-US".to_string()),
        ("{{CURRENT_DATETIME}}", now.format("%Y-%m-%d %H:%M:%S").to_string()),
        ("{{CURRENT_DATE}}", now.format("%Y-%m-%d").to_string()),
        ("{{CURRENT_TIME}}", now.format("%H:%M:%S").to_string()),
        ("{{CURRENT_WEEKDAY}}", now.format("%A").to_string()),
        ("{{CURRENT_TIMEZONE}}", TEMPLATE_TIMEZONE.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str, messages: Value) -> ChatRequest {
        serde_json::from_value(json!({"model": model, "messages": messages, "stream": true}))
            .unwrap()
    }

    #[test]
    fn nothink_maps_to_base_model() {
        assert_eq!(upstream_model(MODEL_ID_NOTHINK), MODEL_ID);
        assert_eq!(upstream_model(MODEL_ID), MODEL_ID);
        assert_eq!(upstream_model("custom"), "custom");
    }

    #[test]
    fn payload_shape() {
        let req = request(MODEL_ID_NOTHINK, json!([{"role": "user", "content": "hi"}]));
        let payload = build_payload(&req);
        let value = serde_json::to_value(&payload).unwrap();

        // client asked for a stream, upstream never gets one
        assert_eq!(value["stream"], false);
        assert_eq!(value["model"], MODEL_ID);
        assert_eq!(value["messages"][0], json!({"role": "user", "content": "hi"}));
        assert_eq!(value["params"], json!({}));
        assert_eq!(value["tool_servers"], json!([]));
        assert_eq!(
            value["features"],
            json!({"image_generation": false, "code_interpreter": false, "web_search": false})
        );
        assert_eq!(value["model_item"]["owned_by"], "MBZUAI");
        assert_eq!(value["model_item"]["root"], "mbzuai-k2-think-2508");
        assert!(value["model_item"]["parent"].is_null());
        assert_eq!(value["background_tasks"]["title_generation"], true);
        assert_eq!(value["variables"]["{{CURRENT_TIMEZONE}}"], "Asia/Shanghai");
        assert_eq!(value["variables"]["{{USER_NAME}}"], "User");
        assert!(Uuid::parse_str(&payload.chat_id).is_ok());
        assert_ne!(payload.chat_id, payload.session_id);
    }

    #[test]
    fn text_parts_collapse_to_string() {
        let content = json!([
            {"type": "text", "text": "hello"},
            "there",
            {"type": "text", "text": ""},
            {"type": "audio", "data": "x"}
        ]);
        assert_eq!(normalize_content(&content), json!("hello there"));
    }

    #[test]
    fn image_parts_stay_multimodal() {
        let content = json!([
            {"type": "text", "text": "what is this"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
        ]);
        let normalized = normalize_content(&content);
        assert_eq!(normalized.as_array().unwrap().len(), 2);
        assert_eq!(
            normalized[1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn null_and_scalar_content() {
        assert_eq!(normalize_content(&Value::Null), json!(""));
        assert_eq!(normalize_content(&json!(42)), json!("42"));
    }
}
