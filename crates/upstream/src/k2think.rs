//! reqwest-backed K2Think client

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, warn};
use translate::Usage;

use crate::payload::UpstreamPayload;
use crate::{Result, Upstream, UpstreamAnswer, UpstreamError};

const SITE_ORIGIN: &str = "https://www.k2think.ai";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36 Edg/140.0.0.0";

/// Error bodies are cut to this many characters before they reach logs and
/// client-visible messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Deserialize)]
struct RawCompletion {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct RawChoice {
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct K2ThinkClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl K2ThinkClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout.as_secs())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }

    async fn send(&self, payload: &UpstreamPayload, credential: &str) -> Result<UpstreamAnswer> {
        let body = serde_json::to_vec(payload)?;

        let response = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(credential)
            .header(ORIGIN, SITE_ORIGIN)
            .header(REFERER, format!("{SITE_ORIGIN}/c/{}", payload.chat_id))
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            warn!(status = status.as_u16(), body = %body, "upstream returned error status");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        let raw: RawCompletion =
            serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode(e.to_string()))?;

        let content = raw
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        debug!(chars = content.len(), "upstream answer received");

        Ok(UpstreamAnswer {
            content,
            usage: raw.usage,
        })
    }
}

impl Upstream for K2ThinkClient {
    fn id(&self) -> &str {
        "k2think"
    }

    fn complete<'a>(
        &'a self,
        payload: &'a UpstreamPayload,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamAnswer>> + Send + 'a>> {
        Box::pin(self.send(payload, credential))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::build_payload;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use translate::ChatRequest;

    async fn start_mock<H, T>(handler: H) -> String
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/api/chat/completions", post(handler));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/chat/completions")
    }

    fn sample_request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "MBZUAI-IFM/K2-Think",
            "messages": [{"role": "user", "content": "ping"}]
        }))
        .unwrap()
    }

    fn client(url: String, timeout: Duration) -> K2ThinkClient {
        K2ThinkClient::new(reqwest::Client::new(), url, timeout)
    }

    #[tokio::test]
    async fn sends_credential_and_browser_headers() {
        let url = start_mock(|headers: HeaderMap, body: axum::Json<Value>| async move {
            let chat_id = body["chat_id"].as_str().unwrap_or_default().to_string();
            let echoed = json!({
                "authorization": headers["authorization"].to_str().unwrap(),
                "referer_ok": headers["referer"].to_str().unwrap()
                    == format!("https://www.k2think.ai/c/{chat_id}"),
                "origin": headers["origin"].to_str().unwrap(),
                "stream": body["stream"],
            });
            axum::Json(json!({
                "choices": [{"message": {"content": echoed.to_string()}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
            }))
        })
        .await;

        let payload = build_payload(&sample_request());
        let answer = client(url, Duration::from_secs(5))
            .complete(&payload, "tok-123")
            .await
            .unwrap();

        let echoed: Value = serde_json::from_str(&answer.content).unwrap();
        assert_eq!(echoed["authorization"], "Bearer tok-123");
        assert_eq!(echoed["referer_ok"], true);
        assert_eq!(echoed["origin"], "https://www.k2think.ai");
        assert_eq!(echoed["stream"], false);
        assert_eq!(answer.usage.unwrap().total_tokens, 3);
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let url = start_mock(|| async {
            (StatusCode::UNAUTHORIZED, "{\"detail\":\"Not authenticated\"}").into_response()
        })
        .await;

        let payload = build_payload(&sample_request());
        let err = client(url, Duration::from_secs(5))
            .complete(&payload, "expired")
            .await
            .unwrap_err();

        assert!(matches!(err, UpstreamError::Status { status: 401, .. }));
        assert_eq!(
            err.to_string(),
            "upstream error: 401: {\"detail\":\"Not authenticated\"}"
        );
    }

    #[tokio::test]
    async fn missing_content_is_empty_answer() {
        let url = start_mock(|| async { axum::Json(json!({"choices": []})) }).await;

        let payload = build_payload(&sample_request());
        let answer = client(url, Duration::from_secs(5))
            .complete(&payload, "tok")
            .await
            .unwrap();
        assert_eq!(answer, UpstreamAnswer::default());
    }

    #[tokio::test]
    async fn malformed_json_is_decode_error() {
        let url = start_mock(|| async { "not json" }).await;

        let payload = build_payload(&sample_request());
        let err = client(url, Duration::from_secs(5))
            .complete(&payload, "tok")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Decode(_)));
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let url = start_mock(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            axum::Json(json!({"choices": []}))
        })
        .await;

        let payload = build_payload(&sample_request());
        let err = client(url, Duration::from_millis(100))
            .complete(&payload, "tok")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let payload = build_payload(&sample_request());
        let err = client(format!("http://{addr}/"), Duration::from_secs(5))
            .complete(&payload, "tok")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
    }
}
