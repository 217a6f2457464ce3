use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::events::EventKind;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Queue transport failed")]
    Transport(#[from] TransportError),

    #[error("Object storage failed")]
    Storage(#[from] StorageError),

    #[error("OCR extraction failed")]
    Ocr(#[from] OcrError),

    #[error("Search index failed")]
    Index(#[from] IndexError),

    #[error("Unexpected event: expected {expected}, got {found}")]
    UnexpectedEvent { expected: EventKind, found: EventKind },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Message broker errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to broker at {uri}")]
    Connect {
        uri: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Broker channel operation failed on queue {queue}")]
    Channel {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Failed to publish to queue {queue}")]
    Publish {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Broker refused message for queue {queue}")]
    PublishNacked { queue: String },

    #[error("Failed to settle delivery")]
    Settle(#[source] lapin::Error),

    #[error("Failed to encode message")]
    Encode(#[source] serde_json::Error),

    #[error("Broker connection is closed")]
    Closed,
}

/// Object storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {locator}")]
    NotFound { locator: String },

    #[error("Invalid object locator: {locator}")]
    InvalidLocator { locator: String },

    #[error("I/O error on object {locator}")]
    Io {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend error on object {locator}: {message}")]
    Backend { locator: String, message: String },
}

/// OCR engine errors
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}: {stderr}")]
    EngineFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("OCR timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("Rasterizer produced no pages")]
    NoPages,

    #[error("Failed to prepare OCR workspace")]
    Workspace(#[source] std::io::Error),
}

/// Search index errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Search engine error")]
    Engine(#[from] tantivy::TantivyError),

    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Cannot open index directory {path}")]
    Directory {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Index was opened read-only")]
    ReadOnly,

    #[error("Index task failed: {message}")]
    TaskFailed { message: String },
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    /// Whether a failed message handler may succeed if run again.
    ///
    /// Anything not listed here is permanent: retrying would only repeat the
    /// same outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Transport(TransportError::Closed) => false,
            ServiceError::Transport(_) => true,
            ServiceError::Storage(StorageError::Io { .. } | StorageError::Backend { .. }) => true,
            ServiceError::Ocr(
                OcrError::Timeout { .. } | OcrError::Spawn { .. } | OcrError::Workspace(_),
            ) => true,
            _ => false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Transport(_) => "transport_error",
            ServiceError::Storage(StorageError::NotFound { .. }) => "object_not_found",
            ServiceError::Storage(_) => "storage_error",
            ServiceError::Ocr(OcrError::Timeout { .. }) => "ocr_timeout",
            ServiceError::Ocr(_) => "ocr_error",
            ServiceError::Index(IndexError::InvalidQuery { .. }) => "invalid_query",
            ServiceError::Index(_) => "index_error",
            ServiceError::UnexpectedEvent { .. } => "unexpected_event",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(self.error_code().to_string()),
        };

        (status, Json(response)).into_response()
    }
}

/// Render an error and its sources as `outer: inner: root`.
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
