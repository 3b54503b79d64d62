use thiserror::Error;
use uuid::Uuid;

/// Main error type for the signal relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation / configuration errors surfaced to the caller
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid extraction pattern: {0}")]
    InvalidPattern(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Unsupported broker type: {0}")]
    UnsupportedBrokerType(String),

    #[error("Broker connection {0} is not active")]
    InactiveBrokerConnection(Uuid),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Feed session errors
    #[error("Circuit breaker open for {name}, retry in {retry_in_secs}s")]
    CircuitOpen { name: String, retry_in_secs: u64 },

    #[error("Feed protocol error: {0}")]
    Feed(String),

    #[error("Feed session unavailable: {0}")]
    SessionUnavailable(String),

    // Broker execution errors
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        RelayError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Network and timeout failures that are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RelayError::WebSocket(_) | RelayError::Timeout(_) | RelayError::Io(_) => true,
            RelayError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }

    /// The broker definitively declined the order.
    pub fn is_broker_rejection(&self) -> bool {
        matches!(self, RelayError::Execution(ExecutionError::Rejected { .. }))
    }

    /// The order outcome is unknown: confirmation never arrived in time.
    pub fn is_confirmation_timeout(&self) -> bool {
        matches!(
            self,
            RelayError::Execution(ExecutionError::ConfirmationTimeout { .. })
        )
    }
}

/// Errors raised by the per-order broker execution state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("No broker instrument mapped for symbol {0}")]
    UnmappedSymbol(String),

    #[error("Order submission failed: {0}")]
    Submission(String),

    #[error("Order {deal_reference} rejected by broker: {reason}")]
    Rejected {
        deal_reference: String,
        reason: String,
    },

    #[error("No confirmation for order {deal_reference} after {elapsed_ms}ms, outcome unknown")]
    ConfirmationTimeout {
        deal_reference: String,
        elapsed_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_and_timeout_are_distinguishable() {
        let rejected: RelayError = ExecutionError::Rejected {
            deal_reference: "REF1".into(),
            reason: "MARKET_CLOSED".into(),
        }
        .into();
        let timed_out: RelayError = ExecutionError::ConfirmationTimeout {
            deal_reference: "REF2".into(),
            elapsed_ms: 10_000,
        }
        .into();

        assert!(rejected.is_broker_rejection());
        assert!(!rejected.is_confirmation_timeout());
        assert!(timed_out.is_confirmation_timeout());
        assert!(!timed_out.is_broker_rejection());
    }

    #[test]
    fn timeouts_are_transient_validation_is_not() {
        assert!(RelayError::Timeout("connect".into()).is_transient());
        assert!(!RelayError::Validation("bad".into()).is_transient());
        assert!(!RelayError::UnsupportedBrokerType("x".into()).is_transient());
    }
}
