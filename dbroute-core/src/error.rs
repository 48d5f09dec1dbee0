/// Structured error types for dbroute-core.
///
/// Driver errors pass through unchanged inside `Postgres`/`Legacy`.
/// Guard-level failures carry a retriable hint so callers can decide
/// between backing off and failing the request outright.
use thiserror::Error;

/// Main error type for routing and repository operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed or missing connection details
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Backend could not be reached
    #[error("Connectivity error ({backend}): {reason}")]
    Connectivity {
        backend: &'static str,
        reason: String,
    },

    /// No backend active, or a write attempted in degraded read-only mode
    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String, retriable: bool },

    /// SQL references a named parameter that was not supplied
    #[error("No value supplied for parameter @{name}")]
    Binding { name: String },

    /// Primary (Postgres) driver error
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Legacy (SQL Server) driver error
    #[error("Legacy database error: {0}")]
    Legacy(#[from] tiberius::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure raised by a transaction callback
    #[error("Transaction aborted: {0}")]
    Transaction(String),
}

/// Result type alias for dbroute-core operations
pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn connectivity(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            backend,
            reason: reason.into(),
        }
    }

    /// No adapter could be selected; a later re-check may recover.
    pub fn no_active_backend() -> Self {
        Self::ServiceUnavailable {
            reason: "No active database adapter available.".to_string(),
            retriable: true,
        }
    }

    /// Writes are refused until the primary comes back or an operator intervenes.
    pub fn read_only(what: &str) -> Self {
        Self::ServiceUnavailable {
            reason: format!(
                "Database is in degraded read-only mode. {} are blocked.",
                what
            ),
            retriable: false,
        }
    }

    /// The endpoint needs the primary and the router is serving from elsewhere.
    pub fn primary_required() -> Self {
        Self::ServiceUnavailable {
            reason: "Primary database is required for this endpoint.".to_string(),
            retriable: true,
        }
    }

    pub fn transaction(reason: impl Into<String>) -> Self {
        Self::Transaction(reason.into())
    }

    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ServiceUnavailable { retriable, .. } => *retriable,
            Self::Connectivity { .. } => true,
            Self::Postgres(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}
