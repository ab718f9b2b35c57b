use std::fmt::Display;

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::VaultError;
use crate::students::ResolveError;

pub async fn handler404(path: Uri) -> Error {
    Error::NotFound {
        message: format!("Invalid path: {}", path),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Error body returned to clients. Internal failures carry only their kind;
/// the detail goes to the log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    InvalidPayload { message: String },
    UserAlreadyExists { message: String },
    AuthenticationFailure { message: String },
    StudentNotFound { message: String },
    MissingReferences { message: String },
    InvalidReferences { message: String },
    NotFound { message: String },
    InternalError { kind: &'static str, message: String },
}

impl Error {
    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn internal<D: Display>(kind: &'static str, detail: D) -> Error {
        log::error!("{}: {}", kind, detail);
        Error::InternalError {
            kind,
            message: "internal server error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Error::UserAlreadyExists { .. } => StatusCode::CONFLICT,
            Error::AuthenticationFailure { .. } => StatusCode::UNAUTHORIZED,
            Error::StudentNotFound { .. } | Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::MissingReferences { .. }
            | Error::InvalidReferences { .. }
            | Error::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<VaultError> for Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Invalid(message) => Error::invalid(message),
            VaultError::Conflict => Error::UserAlreadyExists {
                message: "user already exists".to_string(),
            },
            // unknown email and wrong password must look identical
            VaultError::Unauthorized => Error::AuthenticationFailure {
                message: "invalid credentials".to_string(),
            },
            VaultError::Store(err) => Error::internal("DatabaseError", err),
            other => Error::internal("AuthError", other),
        }
    }
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Invalid(message) => Error::invalid(message),
            ResolveError::StudentNotFound => Error::StudentNotFound {
                message: err.to_string(),
            },
            ResolveError::MissingReferences => Error::MissingReferences {
                message: err.to_string(),
            },
            ResolveError::InvalidReferences => Error::InvalidReferences {
                message: err.to_string(),
            },
            ResolveError::Store(err) => Error::internal("DatabaseError", err),
        }
    }
}
