use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Postgres SQLSTATE codes we translate into client-facing errors.
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";

/// Enumeration of errors for roster operations.
///
/// Every roster mutation runs in a single transaction, so any of these aborts the whole operation.
#[derive(Error, Debug)]
pub enum RosterError {
    /// Rejected before any mutation: bad marks, dates, empty names...
    #[error("invalid request: {0}")]
    Validation(String),
    /// An eligibility rule was violated inside the mutating transaction.
    #[error("{0}")]
    Conflict(String),
    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),
    /// A programming-contract violation, e.g. a department with students but no instructors
    /// reaching the balancer. Never retried.
    #[error("roster invariant violated: {0}")]
    InvariantBreach(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

pub type RosterResult<T> = std::result::Result<T, RosterError>;

impl RosterError {
    /// Only database errors may go away on their own (serialization failures, dropped connections).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RosterError::Database(_))
    }
}

impl From<sqlx::Error> for RosterError {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            match db_error.code().as_deref() {
                Some(UNIQUE_VIOLATION) => {
                    return RosterError::Conflict(format!(
                        "a record with the same unique value already exists: {}",
                        db_error.message()
                    ))
                }
                Some(FOREIGN_KEY_VIOLATION) => {
                    return RosterError::Conflict(format!(
                        "record is still referenced or references a missing record: {}",
                        db_error.message()
                    ))
                }
                Some(CHECK_VIOLATION) => {
                    return RosterError::Validation(db_error.message().to_owned())
                }
                _ => {}
            }
        }

        RosterError::Database(error)
    }
}

/// The body of every error response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for RosterError {
    fn into_response(self) -> Response {
        let status = match &self {
            RosterError::Validation(_) => StatusCode::BAD_REQUEST,
            RosterError::Conflict(_) => StatusCode::CONFLICT,
            RosterError::NotFound(_, _) => StatusCode::NOT_FOUND,
            RosterError::InvariantBreach(_) | RosterError::Database(_) => {
                error!("internal error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
