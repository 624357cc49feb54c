//! Error types for the Conduit Control Plane.
//!
//! Every engine operation returns [`AppResult`]. Lock contention is an
//! expected outcome under concurrency and is reported as [`AppError::Locked`]
//! so that loops can retry it on their next tick instead of treating it as
//! a failure.

use std::fmt;

use thiserror::Error;

use crate::engine::state::Status;

/// PostgreSQL SQLSTATE raised by `FOR UPDATE NOWAIT` on a held row.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Application-level errors for the control plane.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Illegal status transition requested by a caller
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    /// A non-blocking row lock could not be acquired
    #[error("Resource locked: {0}")]
    Locked(String),

    /// Job already taken or booked by another agent
    #[error("Job already taken: {0}")]
    AlreadyTaken(String),

    /// Restart requested on a node whose ancestors have not run
    #[error("Parent node not run: {0}")]
    ParentNotRun(String),

    /// Conflict error
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Aggregated parameter interpolation errors
    #[error("Parameter errors: {0}")]
    Parameters(MultiError),

    /// External service error
    #[error("External service error: {0}")]
    ExternalService(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failed operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Locked(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                AppError::Locked(db.message().to_string())
            }
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            _ => AppError::Database(err),
        }
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<MultiError> for AppError {
    fn from(err: MultiError) -> Self {
        AppError::Parameters(err)
    }
}

/// A single failed parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterError {
    pub name: String,
    pub message: String,
}

/// Every parameter that failed to resolve, reported at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<ParameterError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ParameterError {
            name: name.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ParameterError] {
        &self.errors
    }

    /// `Ok(value)` when nothing failed, the aggregate otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T, MultiError> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.errors.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", err.name, err.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("node run 42".to_string());
        assert_eq!(err.to_string(), "Resource not found: node run 42");
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = AppError::InvalidTransition {
            from: Status::Success,
            to: Status::Building,
        };
        assert_eq!(err.to_string(), "Invalid transition from Success to Building");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_locked_is_retryable() {
        assert!(AppError::Locked("workflow_run 1".to_string()).is_retryable());
    }

    #[test]
    fn test_multi_error_aggregates_all() {
        let mut errs = MultiError::new();
        errs.push("cds.env.url", "undefined value");
        errs.push("build.tag", "syntax error");
        assert_eq!(errs.len(), 2);
        assert_eq!(
            errs.to_string(),
            "cds.env.url: undefined value, build.tag: syntax error"
        );
        assert!(errs.into_result(()).is_err());
        assert_eq!(MultiError::new().into_result(7), Ok(7));
    }
}
