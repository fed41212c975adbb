//! HTTP and gRPC error mapping for the controller binary.
//!
//! Mirrors the teacher's `zvault-server::error::AppError` split: one error
//! type implementing `IntoResponse` for the admin REST surface, plus a
//! `tonic::Status` conversion for the gRPC surface, both built from the
//! same `sitekeeper-core` error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use sitekeeper_core::error::{CertificateError, ChannelError, StateStoreError};

/// Application-level error returned from admin REST handlers.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unauthorized(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, axum::Json(ErrorBody { error: message })).into_response()
    }
}

impl From<StateStoreError> for AppError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::SiteNotFound { .. } | StateStoreError::JobNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            StateStoreError::DuplicateDomain { .. } | StateStoreError::ReservedDomain => {
                Self::Conflict(err.to_string())
            }
            StateStoreError::ConcurrencyConflict | StateStoreError::LockHeld { .. } => {
                Self::Conflict(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<CertificateError> for AppError {
    fn from(err: CertificateError) -> Self {
        match err {
            CertificateError::NotFound { .. } => Self::NotFound(err.to_string()),
            CertificateError::StillReferenced { .. } => Self::Conflict(err.to_string()),
            CertificateError::WrongType { .. } | CertificateError::InvalidData { .. } => {
                Self::BadRequest(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

/// Maps a channel/state-store error onto a stable gRPC status code, the
/// tonic-side analogue of [`AppError`].
pub fn channel_error_to_status(err: ChannelError) -> tonic::Status {
    match err {
        ChannelError::NotRegistered { .. } => {
            tonic::Status::failed_precondition(err.to_string())
        }
        ChannelError::RegistrationRejected { .. } => {
            tonic::Status::permission_denied(err.to_string())
        }
        ChannelError::Transport { .. } => tonic::Status::unavailable(err.to_string()),
        ChannelError::StateStore(e) => state_store_error_to_status(&e),
        ChannelError::Certificate(e) => certificate_error_to_status(&e),
    }
}

#[must_use]
pub fn state_store_error_to_status(err: &StateStoreError) -> tonic::Status {
    match err {
        StateStoreError::SiteNotFound { .. } | StateStoreError::JobNotFound { .. } => {
            tonic::Status::not_found(err.to_string())
        }
        StateStoreError::DuplicateDomain { .. }
        | StateStoreError::ReservedDomain
        | StateStoreError::ConcurrencyConflict
        | StateStoreError::LockHeld { .. } => tonic::Status::already_exists(err.to_string()),
        StateStoreError::Unavailable => tonic::Status::unavailable(err.to_string()),
        _ => tonic::Status::internal(err.to_string()),
    }
}

#[must_use]
pub fn certificate_error_to_status(err: &CertificateError) -> tonic::Status {
    match err {
        CertificateError::NotFound { .. } => tonic::Status::not_found(err.to_string()),
        CertificateError::StillReferenced { .. } => tonic::Status::already_exists(err.to_string()),
        CertificateError::WrongType { .. } | CertificateError::InvalidData { .. } => {
            tonic::Status::invalid_argument(err.to_string())
        }
        _ => tonic::Status::internal(err.to_string()),
    }
}
