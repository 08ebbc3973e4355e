use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use shared::ErrorResponse;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = ReservationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("not enough stock for {subject_id}: requested {requested}, available {available}")]
    InsufficientStock {
        subject_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{id} is in the wrong state: {reason}")]
    InvalidState { id: Uuid, reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("transaction conflict, retry")]
    TransientConflict,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ReservationError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn invalid_state(id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidState { id, reason: reason.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientConflict)
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::InsufficientStock { .. } => (StatusCode::CONFLICT, "INSUFFICIENT_STOCK"),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::TransientConflict => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT_CONFLICT"),
            Self::InvalidInput(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_INPUT"),
            Self::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE"),
        }
    }
}

impl From<DieselError> for ReservationError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
                Self::TransientConflict
            }
            // 40P01 has no dedicated kind in diesel
            DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)
                if info.message().contains("deadlock detected") =>
            {
                Self::TransientConflict
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for ReservationError {
    fn from(err: bb8::RunError<E>) -> Self {
        Self::Storage(format!("connection pool: {}", err))
    }
}

impl From<shared::UnknownVariant> for ReservationError {
    fn from(err: shared::UnknownVariant) -> Self {
        Self::Storage(err.to_string())
    }
}

impl IntoResponse for ReservationError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
