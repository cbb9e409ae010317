//! Problem details responses

use crate::auth::AuthError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetlink::ssh::TransportError;
use fleetlink::{ErrorKind, FleetlinkError};
use serde::Serialize;
use tracing::{debug, warn};

/// RFC 7807 error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Problem {
    /// Machine-readable problem type
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Short summary
    pub title: String,
    /// HTTP status code
    pub status: u16,
    /// Specific explanation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Problem {
    /// Create a problem without detail
    pub fn new(status: StatusCode, problem_type: &str, title: &str) -> Self {
        Self {
            problem_type: problem_type.to_string(),
            title: title.to_string(),
            status: status.as_u16(),
            detail: None,
        }
    }

    /// Attach a detail message
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Malformed request
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", "Invalid request").with_detail(detail)
    }

    /// Unknown resource
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "Not found").with_detail(detail)
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<FleetlinkError> for Problem {
    fn from(error: FleetlinkError) -> Self {
        let status = match error.kind() {
            ErrorKind::Caller => StatusCode::BAD_REQUEST,
            ErrorKind::Target => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::BAD_REQUEST {
            debug!("Request failed: {}", error);
        } else {
            warn!("Request failed: {}", error);
        }
        Problem::new(status, error.problem_type(), error.title()).with_detail(error.to_string())
    }
}

impl From<TransportError> for Problem {
    fn from(error: TransportError) -> Self {
        FleetlinkError::from(error).into()
    }
}

impl From<AuthError> for Problem {
    fn from(error: AuthError) -> Self {
        Problem::new(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid token")
            .with_detail(error.to_string())
    }
}

impl From<QueryRejection> for Problem {
    fn from(rejection: QueryRejection) -> Self {
        Problem::invalid_request(rejection.body_text())
    }
}

impl From<JsonRejection> for Problem {
    fn from(rejection: JsonRejection) -> Self {
        Problem::invalid_request(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_error_kind() {
        let caller: Problem = FleetlinkError::IsDirectory("/etc".into()).into();
        assert_eq!(caller.status, 400);
        assert_eq!(caller.problem_type, "path_is_directory");

        let target: Problem = FleetlinkError::Connection {
            target: "deploy@10.0.0.5".into(),
            source: TransportError::Connection("connection refused".into()),
        }
        .into();
        assert_eq!(target.status, 502);
        assert_eq!(target.problem_type, "connection_err");
        assert!(target.detail.unwrap().contains("connection refused"));

        let internal: Problem = FleetlinkError::Transport(TransportError::Cancelled).into();
        assert_eq!(internal.status, 500);
    }

    #[test]
    fn test_unauthorized() {
        let problem: Problem = AuthError::Expired.into();
        assert_eq!(problem.status, 401);
        assert_eq!(problem.problem_type, "unauthorized");
        assert_eq!(problem.detail.as_deref(), Some("Token expired"));
    }

    #[test]
    fn test_response_shape() {
        let response = Problem::invalid_request("missing path").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let json = serde_json::to_value(Problem::new(StatusCode::NOT_FOUND, "not_found", "Not found")).unwrap();
        assert_eq!(json["type"], "not_found");
        assert_eq!(json["status"], 404);
        assert!(json.get("detail").is_none());
    }
}
