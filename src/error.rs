//! Supervisor errors and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Boxed error type carried by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Errors returned synchronously from supervisor lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The service binary could not be found in any search location
    #[error("binary '{name}' not found (searched {} locations)", searched.len())]
    BinaryNotFound {
        name: String,
        searched: Vec<PathBuf>,
    },
    /// `start` was called while the service is still running
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),
    /// The OS refused to spawn the process
    #[error("failed to spawn '{}': {source}", path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error codes for responses produced by the gateway itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No service is mounted at the requested path
    UnknownService,
    /// Service is not running or has not passed its health check yet
    ServiceNotReady,
    /// Upstream request timed out
    RequestTimeout,
    /// Failed to build or send the upstream request
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownService => StatusCode::NOT_FOUND,
            GatewayErrorCode::ServiceNotReady => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownService => "UNKNOWN_SERVICE",
            GatewayErrorCode::ServiceNotReady => "SERVICE_NOT_READY",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::UnknownService.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayErrorCode::ServiceNotReady.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GatewayErrorCode::ServiceNotReady, "auth is not ready");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"SERVICE_NOT_READY\""));
        assert!(json.contains("\"message\":\"auth is not ready\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::ConnectionFailed, "upstream refused");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }

    #[test]
    fn test_binary_not_found_message_counts_paths() {
        let err = SupervisorError::BinaryNotFound {
            name: "gotrue".to_string(),
            searched: vec![PathBuf::from("/a/gotrue"), PathBuf::from("/b/gotrue")],
        };
        assert_eq!(
            err.to_string(),
            "binary 'gotrue' not found (searched 2 locations)"
        );
    }

    #[test]
    fn test_already_running_message() {
        let err = SupervisorError::AlreadyRunning("auth".to_string());
        assert_eq!(err.to_string(), "service 'auth' is already running");
    }
}
