use std::io;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Pin not found: {0}")]
    NotFoundPin(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl GpioError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        GpioError::Io {
            context: context.into(),
            source,
        }
    }

    /// Kind of the underlying I/O failure, if this is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            GpioError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

impl ResponseError for GpioError {
    fn status_code(&self) -> StatusCode {
        match self {
            GpioError::NotFoundPin(_) => StatusCode::NOT_FOUND,
            GpioError::InvalidState(_) | GpioError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            GpioError::PreconditionViolated(_) => StatusCode::CONFLICT,
            GpioError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            GpioError::Config(_) | GpioError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
