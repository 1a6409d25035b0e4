//! Error types for civic-intake

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CivicError {
    #[error("No credentials and no device identifier supplied")]
    MissingIdentity,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid contribution: {0}")]
    InvalidContribution(String),

    #[error("Already contributed: {0}")]
    AlreadyContributed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(DieselError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CivicError {
    /// Stable machine-readable kind, used as the `error` field of HTTP bodies
    pub fn kind(&self) -> &'static str {
        match self {
            CivicError::MissingIdentity => "missing_identity",
            CivicError::NotFound(_) => "not_found",
            CivicError::Forbidden(_) => "forbidden",
            CivicError::InvalidContribution(_) => "invalid_contribution",
            CivicError::AlreadyContributed(_) => "already_contributed",
            CivicError::StoreUnavailable(_) => "store_unavailable",
            CivicError::InvalidInput(_) | CivicError::Json(_) => "invalid_input",
            CivicError::Conflict(_) => "conflict",
            CivicError::LimitReached(_) => "limit_reached",
            CivicError::Auth(_) => "unauthorized",
            CivicError::Config(_)
            | CivicError::Io(_)
            | CivicError::Database(_)
            | CivicError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may retry the same request unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, CivicError::StoreUnavailable(_))
    }

    /// True when this wraps a unique/primary-key constraint violation
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, CivicError::Database(err) if is_unique_violation(err))
    }
}

/// True when a Diesel error is a unique/primary-key constraint violation
pub fn is_unique_violation(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

impl From<DieselError> for CivicError {
    fn from(err: DieselError) -> Self {
        // SQLITE_BUSY surfaces as an unknown database error once busy_timeout expires
        if let DieselError::DatabaseError(_, ref info) = err {
            let msg = info.message();
            if msg.contains("database is locked") || msg.contains("database is busy") {
                return CivicError::StoreUnavailable(msg.to_string());
            }
        }
        CivicError::Database(err)
    }
}

impl From<diesel::r2d2::PoolError> for CivicError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        CivicError::StoreUnavailable(format!("Connection pool: {}", err))
    }
}

pub type Result<T, E = CivicError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_transient() {
        assert!(CivicError::StoreUnavailable("pool timeout".into()).is_transient());
        assert!(!CivicError::AlreadyContributed("poll".into()).is_transient());
        assert!(!CivicError::MissingIdentity.is_transient());
    }

    #[test]
    fn test_not_found_diesel_error_is_not_unique_violation() {
        assert!(!is_unique_violation(&DieselError::NotFound));
    }

    #[test]
    fn test_kinds_are_distinct_for_contribution_failures() {
        assert_ne!(
            CivicError::InvalidContribution("x".into()).kind(),
            CivicError::AlreadyContributed("x".into()).kind()
        );
        assert_eq!(CivicError::Forbidden("x".into()).kind(), "forbidden");
        assert_eq!(CivicError::NotFound("x".into()).kind(), "not_found");
    }
}
