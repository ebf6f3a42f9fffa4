//! Error taxonomy (§7) and its HTTP mapping.
//!
//! Every fallible core operation returns `Result<T, ErrorKind>`. The
//! enum implements [`axum::response::IntoResponse`] so HTTP handlers can
//! propagate `?` directly; infrastructure failures (I/O, SQLite, SDK
//! errors) are folded into `ErrorKind::Internal` via `#[from] anyhow::Error`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Generate a request id for correlating logs with a response.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Content-Length is required")]
    LengthRequired,

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("not modified")]
    NotModified,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("range not satisfiable")]
    BadRange,

    #[error("not implemented")]
    NotImplemented(String),

    /// Internal-only: signals an overlay sub-backend miss. Never
    /// surfaced to a caller; the overlay backend catches it and tries
    /// the next sub-backend (§4.6).
    #[error("object version missing from this backend")]
    ObjectVersionMissing,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden(_) => StatusCode::FORBIDDEN,
            ErrorKind::NotFound(_) => StatusCode::NOT_FOUND,
            ErrorKind::Conflict(_) => StatusCode::CONFLICT,
            ErrorKind::LengthRequired => StatusCode::LENGTH_REQUIRED,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::NotModified => StatusCode::NOT_MODIFIED,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::BadRange => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorKind::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::ObjectVersionMissing => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest(_) => "BadRequest",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::Forbidden(_) => "Forbidden",
            ErrorKind::NotFound(_) => "NotFound",
            ErrorKind::Conflict(_) => "Conflict",
            ErrorKind::LengthRequired => "LengthRequired",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::NotModified => "NotModified",
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::BadRange => "BadRange",
            ErrorKind::NotImplemented(_) => "NotImplemented",
            ErrorKind::ObjectVersionMissing => "ObjectVersionMissing",
            ErrorKind::Internal(_) => "InternalError",
        }
    }
}

impl IntoResponse for ErrorKind {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        if matches!(self, ErrorKind::Internal(_) | ErrorKind::ObjectVersionMissing) {
            tracing::error!(request_id = %request_id, error = %self, "internal error");
        } else {
            tracing::warn!(request_id = %request_id, error = %self, code = self.code(), "request failed");
        }

        if matches!(self, ErrorKind::NotModified) {
            let mut resp = StatusCode::NOT_MODIFIED.into_response();
            resp.headers_mut()
                .insert("x-request-id", request_id.parse().unwrap());
            return resp;
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        let mut resp = (status, body).into_response();
        resp.headers_mut()
            .insert("x-request-id", request_id.parse().unwrap());
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ErrorKind::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::LengthRequired.status_code(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(ErrorKind::BadRange.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[test]
    fn request_id_is_hex() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
