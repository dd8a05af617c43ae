//! Error types and result handling for queue storage and envelope codecs.
//!
//! Database failures are mapped from `sqlx` errors, envelope codec failures
//! from `serde_json`. Callers in the delivery crate translate these into
//! their own taxonomy (transient store fault, configuration fault).

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and codec operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Message envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested queue row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl CoreError {
    /// Returns true for failures of the store itself rather than of the
    /// data handed to it.
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
