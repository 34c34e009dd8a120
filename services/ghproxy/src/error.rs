//! Error types for the proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors which end the handling of a request, each carrying the status and
/// message shown to the client.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Malformed input: missing path segments, unsupported actions, bad redirects
    #[error("{0}")]
    BadRequest(String),

    /// The request is not allowed by the current configuration
    #[error("{0}")]
    Forbidden(String),

    /// No route, or the upstream has nothing at this location
    #[error("{0}")]
    NotFound(String),

    /// An upstream status surfaced to the client as-is
    #[error("{message}")]
    Status {
        /// Status reported by the upstream
        status: StatusCode,
        /// Message for the client
        message: String,
    },

    /// Building, sending or reading an upstream request failed
    #[error("{context}: {source}")]
    Upstream {
        /// What the proxy was doing when the failure happened
        context: &'static str,
        /// The underlying transport error
        #[source]
        source: upstream_client::Error,
    },

    /// Upstream misbehaved in a way that is not a transport failure
    #[error("{0}")]
    Protocol(String),
}

impl ProxyError {
    pub(crate) fn upstream(context: &'static str) -> impl FnOnce(upstream_client::Error) -> Self {
        move |source| ProxyError::Upstream { context, source }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Status { status, .. } => *status,
            ProxyError::Upstream { .. } | ProxyError::Protocol(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for registry error responses
    pub fn error_code(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "NAME_INVALID",
            StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
            StatusCode::FORBIDDEN => "DENIED",
            StatusCode::NOT_FOUND => "NAME_UNKNOWN",
            StatusCode::TOO_MANY_REQUESTS => "TOOMANYREQUESTS",
            _ => "UNKNOWN",
        }
    }
}

/// Registry error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, "{message}");
        } else {
            tracing::debug!(%status, "{message}");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ProxyError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::Status {
                status: StatusCode::UNAUTHORIZED,
                message: "Unauthorized".into()
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::Protocol("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn renders_registry_error_body() {
        let response = ProxyError::Forbidden("Docker is not Allowed".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "errors": [{"code": "DENIED", "message": "Docker is not Allowed"}]
            })
        );
    }
}
