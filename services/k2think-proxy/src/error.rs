//! Per-request error taxonomy
//!
//! Everything a client can see as an HTTP error goes through `ProxyError`,
//! rendered in the OpenAI error shape `{"error": {"message", "type"}}`.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("no upstream credential available, a refresh may be in progress")]
    NoCredentialAvailable,

    #[error("{0}")]
    UpstreamAuth(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Serialization(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoCredentialAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamAuth(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(_) | ProxyError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Authentication(_) => "authentication_error",
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::UpstreamAuth(_) => "upstream_error",
            ProxyError::Timeout(_) => "timeout_error",
            ProxyError::NoCredentialAvailable
            | ProxyError::Upstream(_)
            | ProxyError::Serialization(_) => "api_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (
            self.status(),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn render(err: ProxyError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn maps_every_variant_to_status_and_type() {
        let cases = [
            (
                ProxyError::Authentication("Invalid API key".into()),
                401,
                "authentication_error",
            ),
            (
                ProxyError::InvalidRequest("bad json".into()),
                400,
                "invalid_request_error",
            ),
            (ProxyError::NoCredentialAvailable, 503, "api_error"),
            (
                ProxyError::UpstreamAuth("upstream error: 403: forbidden".into()),
                502,
                "upstream_error",
            ),
            (ProxyError::Upstream("boom".into()), 500, "api_error"),
            (
                ProxyError::Timeout("upstream timeout after 60s".into()),
                504,
                "timeout_error",
            ),
            (ProxyError::Serialization("nan".into()), 500, "api_error"),
        ];

        for (err, status, kind) in cases {
            let (got_status, body) = render(err).await;
            assert_eq!(got_status.as_u16(), status);
            assert_eq!(body["error"]["type"], kind);
            assert!(body["error"]["message"].is_string());
        }
    }

    #[tokio::test]
    async fn message_is_passed_through() {
        let (_, body) = render(ProxyError::InvalidRequest("messages is required".into())).await;
        assert_eq!(body["error"]["message"], "messages is required");
    }
}
