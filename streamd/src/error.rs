//! Error kinds and their HTTP disposition (spec §7).
//!
//! All errors are terminal: none are retried server-side, and every error
//! response carries `Cache-Control: no-store` so the edge cache never
//! stores a failure.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    BadInput,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    PayloadTooLarge,
    Internal,
    StorageExhausted,
}

impl Kind {
    fn status(self) -> StatusCode {
        match self {
            Kind::BadInput => StatusCode::BAD_REQUEST,
            Kind::Unauthorized => StatusCode::UNAUTHORIZED,
            Kind::Forbidden => StatusCode::FORBIDDEN,
            Kind::NotFound => StatusCode::NOT_FOUND,
            Kind::Conflict => StatusCode::CONFLICT,
            Kind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Kind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Kind::StorageExhausted => StatusCode::INSUFFICIENT_STORAGE,
        }
    }

    fn code(self) -> &'static str {
        match self {
            Kind::BadInput => "BAD_INPUT",
            Kind::Unauthorized => "UNAUTHORIZED",
            Kind::Forbidden => "FORBIDDEN",
            Kind::NotFound => "NOT_FOUND",
            Kind::Conflict => "CONFLICT",
            Kind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Kind::Internal => "INTERNAL",
            Kind::StorageExhausted => "STORAGE_EXHAUSTED",
        }
    }
}

/// An error any handler can return; converts to the spec §7 HTTP
/// disposition. A handful of kinds carry extra response headers
/// (`Producer-Epoch`, `Producer-Expected-Seq`, `Producer-Received-Seq`,
/// `Stream-Closed`) — attach them with `with_header` rather than growing
/// a header field onto every variant.
#[derive(Debug, Clone)]
pub struct AppError {
    kind: Kind,
    message: String,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl AppError {
    fn new(kind: Kind, message: impl Into<String>) -> Self {
        AppError { kind, message: message.into(), headers: Vec::new() }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(Kind::BadInput, message)
    }
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Kind::Unauthorized, message)
    }
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Kind::Forbidden, message)
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Kind::Conflict, message)
    }
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(Kind::PayloadTooLarge, message)
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }
    pub fn storage_exhausted(message: impl Into<String>) -> Self {
        Self::new(Kind::StorageExhausted, message)
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: String) -> Self {
        if let Ok(v) = HeaderValue::from_str(&value) {
            self.headers.push((name, v));
        }
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for AppError {}

// `BadInput` is the natural landing spot for storage errors bubbled up
// via `?` from code that has no more specific classification available
// (callers that can distinguish should construct the right kind directly).
impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::internal(format!("sqlite error: {e}"))
    }
}
impl From<crate::hot_storage::StorageError> for AppError {
    fn from(e: crate::hot_storage::StorageError) -> Self {
        AppError::internal(format!("storage error: {e}"))
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.kind == Kind::Internal {
            tracing::error!(error = %self, "internal error");
        }
        let status = self.kind.status();
        let code = self.kind.code();
        let mut response =
            (status, Json(ErrorEnvelope { code, message: &self.message })).into_response();
        response
            .headers_mut()
            .insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Accepts any-case ASCII (`Producer-Epoch`, `Stream-Closed`, ...) since
/// `HeaderName::from_static` requires an already-lowercase literal.
pub fn header_name(name: &str) -> HeaderName {
    HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).expect("valid header name")
}
