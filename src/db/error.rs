use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("query failed: {context}")]
    Query {
        context: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    /// Acquire could not be satisfied within the timeout. Retryable.
    #[error("pool exhausted: no session available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("pool is closed")]
    PoolClosed,

    /// Client-side statement timeout; the connection is discarded
    /// because its state is unknown.
    #[error("statement timed out after {ms}ms")]
    StatementTimeout { ms: u64 },

    #[error("permission denied on {object}")]
    PermissionDenied { object: String },

    #[error("extension {name} is not installed")]
    ExtensionMissing { name: &'static str },

    #[error("bad input: {message}")]
    BadInput { message: String },

    /// Structured cancellation, never logged as an error.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invariant violated: {context}")]
    Invariant { context: String },
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Transient driver conditions worth a backoff-and-retry: dropped
    /// connections, deadlocks, serialization failures, admin shutdown.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Postgres(e) | Self::Query { source: e, .. } => is_transient_pg(e),
            Self::PoolExhausted { .. } | Self::StatementTimeout { .. } => true,
            _ => false,
        }
    }

    /// Permanent conditions that must fail fast (constraint violations,
    /// encoding errors, bad input). Everything not transient and not
    /// cancellation counts.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient() && !matches!(self, Self::Cancelled)
    }
}

fn is_transient_pg(e: &tokio_postgres::Error) -> bool {
    // A closed connection reports no SQLSTATE.
    let Some(code) = e.code() else {
        return e.is_closed();
    };
    matches!(
        *code,
        SqlState::T_R_SERIALIZATION_FAILURE
            | SqlState::T_R_DEADLOCK_DETECTED
            | SqlState::CONNECTION_EXCEPTION
            | SqlState::CONNECTION_DOES_NOT_EXIST
            | SqlState::CONNECTION_FAILURE
            | SqlState::ADMIN_SHUTDOWN
            | SqlState::CRASH_SHUTDOWN
            | SqlState::CANNOT_CONNECT_NOW
    )
}

/// True when the error is a privilege problem (SQLSTATE 42501), which
/// disables the affected component rather than failing the cycle.
pub fn is_permission_denied(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE)
}

/// True when the error means a relation or view referenced by a
/// diagnostic query does not exist (e.g. `pg_stat_statements` without
/// the extension).
pub fn is_undefined_table(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNDEFINED_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_is_transient() {
        let err = DbError::PoolExhausted { waited_ms: 5000 };
        assert!(err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn bad_input_is_permanent() {
        let err = DbError::BadInput {
            message: "column count mismatch".into(),
        };
        assert!(!err.is_transient());
        assert!(err.is_permanent());
    }

    #[test]
    fn cancellation_is_neither() {
        let err = DbError::Cancelled;
        assert!(!err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn display_includes_context() {
        let err = DbError::ExtensionMissing {
            name: "pg_stat_statements",
        };
        assert_eq!(
            err.to_string(),
            "extension pg_stat_statements is not installed"
        );
    }
}
