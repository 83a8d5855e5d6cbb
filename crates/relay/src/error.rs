use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bookclub_common::{protocol::ws::ServerFrame, types::ValidationError};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::collab::StoreError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AdmissionRejected,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    StaleRevision,
    TransientIo,
    RoomReadOnly,
    UpgradeRequired,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AdmissionRejected => "ADMISSION_REJECTED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::StaleRevision => "STALE_REVISION",
            Self::TransientIo => "TRANSIENT_IO",
            Self::RoomReadOnly => "ROOM_READ_ONLY",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AdmissionRejected => StatusCode::UNAUTHORIZED,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::StaleRevision => StatusCode::CONFLICT,
            Self::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
            Self::RoomReadOnly => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may resend the same operation unchanged.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::TransientIo | Self::RoomReadOnly | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AdmissionRejected => "identity token missing, malformed or expired",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::StaleRevision => "document changed since the base revision",
            Self::TransientIo => "storage is temporarily unavailable",
            Self::RoomReadOnly => "room is temporarily read-only",
            Self::UpgradeRequired => "client protocol version is not supported",
            Self::InternalError => "internal server error",
        }
    }
}

/// Errors raised while serving a session's request. Each maps to exactly one
/// wire error code and never changes room state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("admission rejected: {0}")]
    Admission(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("stale base revision; current revision is {current_revision}")]
    StaleRevision { current_revision: u64, text: String },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("storage unavailable: {0}")]
    TransientIo(String),
    #[error("room is read-only until storage recovers")]
    ReadOnly,
    #[error("{0}")]
    Validation(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Admission(_) => ErrorCode::AdmissionRejected,
            Self::Authorization(_) => ErrorCode::AuthForbidden,
            Self::StaleRevision { .. } => ErrorCode::StaleRevision,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::TransientIo(_) => ErrorCode::TransientIo,
            Self::ReadOnly => ErrorCode::RoomReadOnly,
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::UnsupportedProtocol(_) => ErrorCode::UpgradeRequired,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Error frame reported to the initiating session only.
    pub fn to_frame(&self) -> ServerFrame {
        let code = self.code();
        let (revision, text) = match self {
            Self::StaleRevision { current_revision, text } => {
                (Some(*current_revision), Some(text.clone()))
            }
            _ => (None, None),
        };
        let message = match self {
            // Internal details stay in the logs.
            Self::Internal(_) => code.default_message().to_string(),
            other => other.to_string(),
        };

        ServerFrame::Error {
            code: code.as_str().to_string(),
            message,
            retryable: code.retryable(),
            revision,
            text,
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(message) => Self::TransientIo(message),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Other(message) => Self::Internal(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<SyncError> for RelayError {
    fn from(error: SyncError) -> Self {
        let code = error.code();
        let details = match &error {
            SyncError::StaleRevision { current_revision, .. } => {
                json!({ "current_revision": current_revision })
            }
            _ => json!({}),
        };
        let message = match error {
            SyncError::Internal(_) => code.default_message().to_string(),
            other => other.to_string(),
        };
        Self::new(code, message).with_details(details)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use bookclub_common::protocol::ws::ServerFrame;
    use serde_json::Value;

    use super::{with_request_id_scope, ErrorCode, RelayError, SyncError};
    use crate::collab::StoreError;

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn relay_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            RelayError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            RelayError::from_code(ErrorCode::AuthForbidden)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
    }

    #[test]
    fn stale_revision_frame_carries_current_state() {
        let frame =
            SyncError::StaleRevision { current_revision: 7, text: "current".into() }.to_frame();
        assert_eq!(
            frame,
            ServerFrame::Error {
                code: "STALE_REVISION".into(),
                message: "stale base revision; current revision is 7".into(),
                retryable: false,
                revision: Some(7),
                text: Some("current".into()),
            }
        );
    }

    #[test]
    fn internal_details_are_not_sent_to_clients() {
        let ServerFrame::Error { code, message, retryable, .. } =
            SyncError::Internal("lock poisoned at room 42".into()).to_frame()
        else {
            panic!("expected error frame");
        };
        assert_eq!(code, "INTERNAL_ERROR");
        assert_eq!(message, "internal server error");
        assert!(retryable);
    }

    #[test]
    fn store_errors_map_onto_the_taxonomy() {
        assert_eq!(
            SyncError::from(StoreError::Unavailable("down".into())).code(),
            ErrorCode::TransientIo
        );
        assert_eq!(SyncError::from(StoreError::NotFound("message")).code(), ErrorCode::NotFound);
        assert_eq!(
            SyncError::from(StoreError::Other("boom".into())).code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn retryability_follows_the_registry() {
        assert!(SyncError::TransientIo("x".into()).code().retryable());
        assert!(SyncError::ReadOnly.code().retryable());
        assert!(!SyncError::Authorization("x".into()).code().retryable());
        assert!(!SyncError::StaleRevision { current_revision: 1, text: String::new() }
            .code()
            .retryable());
    }

    #[tokio::test]
    async fn sync_errors_render_as_http_errors() {
        let response = RelayError::from(SyncError::Authorization("room is private".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "AUTH_FORBIDDEN");
        assert_eq!(parsed["error"]["message"], "not authorized: room is private");
    }
}
