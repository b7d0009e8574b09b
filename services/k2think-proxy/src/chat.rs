//! OpenAI-compatible endpoints

use std::convert::Infallible;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use common::Secret;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Span, field, info, instrument, warn};
use translate::{ChatRequest, MODEL_ID, MODEL_ID_NOTHINK, MODEL_OWNER, MODEL_ROOT};
use uuid::Uuid;

use crate::AppState;
use crate::error::ProxyError;
use crate::metrics::record_request;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

fn authorize(headers: &HeaderMap, api_key: &Secret<String>) -> Result<(), ProxyError> {
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ProxyError::Authentication("Missing API key".into()))?;

    if api_key.matches(provided.trim()) {
        Ok(())
    } else {
        Err(ProxyError::Authentication("Invalid API key provided".into()))
    }
}

fn parse_request(body: &[u8]) -> Result<ChatRequest, ProxyError> {
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid request body: {e}")))?;
    if request.messages.is_empty() {
        return Err(ProxyError::InvalidRequest("messages must not be empty".into()));
    }
    Ok(request)
}

fn sse_response(rx: mpsc::Receiver<String>) -> Response {
    let frames = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn dispatch(state: &AppState, request: ChatRequest) -> Result<Response, ProxyError> {
    if request.stream {
        let rx = state.orchestrator.stream(request).await?;
        return Ok(sse_response(rx));
    }

    let reply = state.orchestrator.complete(&request).await?;
    let body =
        serde_json::to_string(&reply).map_err(|e| ProxyError::Serialization(e.to_string()))?;
    Ok((StatusCode::OK, [(CONTENT_TYPE, "application/json")], body).into_response())
}

/// POST /v1/chat/completions
#[instrument(
    skip_all,
    fields(request_id = field::Empty, model = field::Empty, stream = field::Empty)
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", Uuid::new_v4().as_simple());
    let span = Span::current();
    span.record("request_id", request_id.as_str());

    let _in_flight = state.metrics.begin();
    let started = Instant::now();
    let mut stream = false;

    let result = match authorize(&headers, &state.api_key).and_then(|()| parse_request(&body)) {
        Ok(request) => {
            span.record("model", request.model.as_str());
            span.record("stream", request.stream);
            stream = request.stream;
            dispatch(&state, request).await
        }
        Err(e) => Err(e),
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            state.metrics.record_error();
            warn!(status = e.status().as_u16(), error = %e, "chat request failed");
            e.into_response()
        }
    };

    let elapsed = started.elapsed();
    record_request(response.status().as_u16(), stream, elapsed.as_secs_f64());
    info!(
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "chat request handled"
    );
    response
}

/// GET /v1/models
pub async fn list_models() -> impl IntoResponse {
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let data: Vec<_> = [MODEL_ID, MODEL_ID_NOTHINK]
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": MODEL_OWNER,
                "root": MODEL_ROOT,
                "parent": null,
            })
        })
        .collect();

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        json!({ "object": "list", "data": data }).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn bearer_key_must_match() {
        let key = Secret::new("sk-test".to_string());
        assert!(authorize(&headers_with("Bearer sk-test"), &key).is_ok());
        assert!(matches!(
            authorize(&headers_with("Bearer sk-wrong"), &key),
            Err(ProxyError::Authentication(ref m)) if m.contains("Invalid")
        ));
        assert!(matches!(
            authorize(&headers_with("sk-test"), &key),
            Err(ProxyError::Authentication(ref m)) if m.contains("Missing")
        ));
        assert!(authorize(&HeaderMap::new(), &key).is_err());
    }

    #[test]
    fn request_body_is_validated() {
        assert!(matches!(
            parse_request(b"{not json"),
            Err(ProxyError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_request(br#"{"messages": []}"#),
            Err(ProxyError::InvalidRequest(ref m)) if m.contains("empty")
        ));

        let request =
            parse_request(br#"{"messages": [{"role": "user", "content": "hi"}]}"#).unwrap();
        assert_eq!(request.model, MODEL_ID);
        assert!(!request.stream);
    }
}
