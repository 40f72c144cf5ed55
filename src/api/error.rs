//! Unified API error handling with structured response envelopes.
//!
//! Every non-streaming failure yields `{code, message, data?}` with
//! `code != 200`; no endpoint returns a partial success disguised as
//! success.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::sandbox::SandboxError;

/// Client-closed-request, for observed cancellations.
const STATUS_CLIENT_CLOSED: u16 = 499;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Structured response envelope shared by successes and failures.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// A 200 envelope wrapping a payload.
    pub fn ok(data: Value) -> Json<Envelope> {
        Json(Envelope {
            code: 200,
            message: "ok".to_string(),
            data: Some(data),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(status = status.as_u16(), message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) | ApiError::GatewayTimeout(msg) => {
                warn!(status = status.as_u16(), message = %msg, "upstream unavailable");
            }
            _ => {
                debug!(status = status.as_u16(), message = %message, "client error");
            }
        }

        let body = Envelope {
            code: status.as_u16(),
            message,
            data: None,
        };

        (status, Json(body)).into_response()
    }
}

/// Map core errors onto the HTTP taxonomy.
impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(id) => ApiError::NotFound(format!("session {id}")),
            SandboxError::Busy(id) => {
                ApiError::Conflict(format!("session {id} has a turn in flight"))
            }
            SandboxError::PoolExhausted(pool) => {
                ApiError::ServiceUnavailable(format!("port pool '{pool}' exhausted, retry later"))
            }
            SandboxError::Provisioning(msg) => ApiError::BadGateway(msg),
            SandboxError::Unhealthy(msg) => ApiError::BadGateway(msg),
            SandboxError::Upstream(msg) => ApiError::BadGateway(msg),
            SandboxError::Timeout(msg) => ApiError::GatewayTimeout(msg),
            SandboxError::Cancelled => ApiError::Cancelled,
            SandboxError::Config(msg) => ApiError::Internal(msg),
            SandboxError::Other(e) => ApiError::Internal(format!("{e:#}")),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_error_mapping() {
        let cases = [
            (SandboxError::NotFound("s1".into()), StatusCode::NOT_FOUND),
            (SandboxError::Busy("s1".into()), StatusCode::CONFLICT),
            (
                SandboxError::PoolExhausted("api"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SandboxError::Provisioning("clone failed".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SandboxError::Unhealthy("probes failed".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SandboxError::Upstream("agent died".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                SandboxError::Timeout("stream".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }

        assert_eq!(
            ApiError::from(SandboxError::Cancelled).status_code().as_u16(),
            499
        );
    }

    #[test]
    fn test_envelope_shape() {
        let Json(envelope) = Envelope::ok(serde_json::json!({"id": "s1"}));
        assert_eq!(envelope.code, 200);
        assert_eq!(envelope.message, "ok");
        assert!(envelope.data.is_some());
    }
}
