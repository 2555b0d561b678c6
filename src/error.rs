use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    /// Missing or mismatched `x-api-key`
    Unauthorized,
    /// Unusable request body (missing user_id, invalid JSON)
    BadRequest(String),
    /// Token resolution found no row for the user
    NoSubscriptionRow,
    /// Non-success from Google/Apple; upstream status code surfaced
    StoreVerification {
        source: &'static str,
        status: Option<i64>,
        detail: String,
    },
    /// Non-success writing to the subscriptions store; status/body echoed
    Persistence { status: u16, body: String },
    /// Anything else (network failure, malformed upstream body)
    Unexpected(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::NoSubscriptionRow => write!(f, "no subscription row for user"),
            Self::StoreVerification { source, status, detail } => {
                write!(f, "{source} verification failed ({status:?}): {detail}")
            }
            Self::Persistence { status, body } => {
                write!(f, "subscriptions store returned {status}: {body}")
            }
            Self::Unexpected(msg) => write!(f, "unexpected failure: {msg}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, body) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({"ok": false, "error": "unauthorized"}),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"ok": false, "error": msg})),
            Self::NoSubscriptionRow => (
                StatusCode::BAD_REQUEST,
                json!({"ok": false, "error": "no subscription row for user"}),
            ),
            Self::StoreVerification {
                source,
                status,
                detail,
            } => (
                StatusCode::BAD_GATEWAY,
                json!({"ok": false, "source": source, "status": status, "detail": detail}),
            ),
            Self::Persistence { status, body } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"ok": false, "source": "db", "status": status, "detail": body}),
            ),
            Self::Unexpected(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"ok": false, "error": msg}),
            ),
        };
        (code, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Unexpected(e.to_string())
    }
}

impl From<crate::sign::SignError> for AppError {
    fn from(e: crate::sign::SignError) -> Self {
        AppError::Unexpected(e.to_string())
    }
}
