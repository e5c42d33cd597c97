//! Error types for the deposit allocation engine.

use crate::decimal::Decimal4;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Failed to open or read the input file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A referenced user, transaction or portfolio membership does not exist
    #[error("{entity} not found: {reference}")]
    NotFound {
        entity: &'static str,
        reference: String,
    },

    /// No deposit plans to fund, or a plan group cannot be used as a divisor
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    /// A non-positive amount reached the allocation logic
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The unit of work failed to commit; nothing was persisted
    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    /// The computed allocation does not add up to the transaction amount
    #[error("Allocation for transaction {transaction} sums to {allocated}, expected {expected}")]
    Unbalanced {
        transaction: String,
        expected: Decimal4,
        allocated: Decimal4,
    },

    /// Failure while processing one transaction of a batch
    #[error("Transaction {transaction} for user {user} failed: {source}")]
    Transaction {
        user: String,
        transaction: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Invalid environment configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing input file argument
    #[error("Missing input file argument. Usage: deposit-allocator <requests.csv>")]
    MissingArgument,
}

/// Failures of the storage layer. A unit of work that returns one of these
/// has been rolled back in full.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A conditional write matched no row, or a uniqueness rule was violated
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Unit of work exceeded its deadline")]
    DeadlineExceeded,

    #[error("Store lock poisoned by a panicked writer")]
    Poisoned,
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(PersistenceError::Sqlite(err))
    }
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, reference: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            reference: reference.to_string(),
        }
    }

    pub(crate) fn overflow(what: impl std::fmt::Display) -> Self {
        EngineError::InvalidInput(format!("{} exceeds the supported amount range", what))
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        EngineError::Persistence(PersistenceError::Conflict(message.into()))
    }

    /// Returns `true` if resubmitting the same transaction may succeed.
    ///
    /// Only persistence failures qualify: the unit of work was rolled back
    /// and the transaction is still unprocessed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Persistence(_) => true,
            EngineError::Transaction { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Strips the per-transaction context wrapper, if any.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Transaction { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_failures_are_retryable() {
        let err = EngineError::Persistence(PersistenceError::DeadlineExceeded);
        assert!(err.is_retryable());

        let wrapped = EngineError::Transaction {
            user: "user-1".to_string(),
            transaction: "tx-1".to_string(),
            source: Box::new(err),
        };
        assert!(wrapped.is_retryable());
        assert!(matches!(
            wrapped.root(),
            EngineError::Persistence(PersistenceError::DeadlineExceeded)
        ));
    }

    #[test]
    fn test_domain_failures_are_not_retryable() {
        assert!(!EngineError::PreconditionViolation("no plans".into()).is_retryable());
        assert!(!EngineError::InvalidInput("amount".into()).is_retryable());
        assert!(!EngineError::not_found("User", "user-1").is_retryable());
    }

    #[test]
    fn test_context_is_in_message() {
        let err = EngineError::Transaction {
            user: "user-1".to_string(),
            transaction: "tx-9".to_string(),
            source: Box::new(EngineError::not_found("User portfolio", "portfolio-a")),
        };
        let message = err.to_string();
        assert!(message.contains("user-1"));
        assert!(message.contains("tx-9"));
        assert!(message.contains("portfolio-a"));
    }
}
