//! Error types for ledger operations.

use crate::{AccountId, EntryId, TransferId, UserId};
use thiserror::Error;

/// Coarse classification callers use to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced row does not exist.
    NotFound,
    /// Uniqueness or concurrent-modification conflict reported by the store.
    Conflict,
    /// Begin, commit or rollback itself failed.
    Transactional,
    /// Caller passed input the ledger refuses before touching the store.
    Precondition,
    /// Anything else: driver errors, timeouts, configuration.
    Internal,
}

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum BankError {
    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// User not found.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Entry not found.
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Transfer not found.
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// A referenced row is missing (foreign key violation).
    #[error("Referenced row not found: {0}")]
    NotFound(String),

    /// Unique constraint violated.
    #[error("Conflict on {constraint}: {message}")]
    Conflict { constraint: String, message: String },

    /// The store aborted the transaction to resolve a concurrent conflict.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Could not open a transaction.
    #[error("Cannot begin transaction: {0}")]
    BeginFailed(String),

    /// Commit failed; the transaction's writes are not durable.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Work failed and the rollback that followed failed too.
    #[error("Transaction error: {error}, rollback error: {rollback}")]
    RollbackFailed {
        error: Box<BankError>,
        rollback: Box<BankError>,
    },

    /// Transaction handle used after commit or rollback.
    #[error("Transaction already closed")]
    TransactionClosed,

    /// Source and destination are the same account.
    #[error("Cannot transfer to the same account: {0}")]
    SameAccount(AccountId),

    /// Transfer amount must be positive.
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    /// Account currency differs from the transfer currency.
    #[error("Account {account_id} currency {actual} does not match transfer currency {expected}")]
    CurrencyMismatch {
        account_id: AccountId,
        expected: String,
        actual: String,
    },

    /// Currency not held by the bank.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// A row failed a check constraint.
    #[error("Check constraint {constraint} violated: {message}")]
    CheckViolation { constraint: String, message: String },

    /// Field-level validation failure.
    #[error("Invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(String),

    /// Deadline expired before the operation finished.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failure raised on purpose by a test store.
    #[error("Injected fault: {0}")]
    InjectedFault(String),
}

impl BankError {
    /// Shorthand for a not-found error on a user looked up by id.
    pub fn user_id_not_found(id: UserId) -> Self {
        BankError::UserNotFound(format!("id={id}"))
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BankError::AccountNotFound(_)
            | BankError::UserNotFound(_)
            | BankError::EntryNotFound(_)
            | BankError::TransferNotFound(_)
            | BankError::NotFound(_) => ErrorKind::NotFound,
            BankError::Conflict { .. } | BankError::SerializationFailure(_) => ErrorKind::Conflict,
            BankError::BeginFailed(_)
            | BankError::CommitFailed(_)
            | BankError::RollbackFailed { .. }
            | BankError::TransactionClosed => ErrorKind::Transactional,
            BankError::SameAccount(_)
            | BankError::InvalidAmount(_)
            | BankError::CurrencyMismatch { .. }
            | BankError::UnsupportedCurrency(_)
            | BankError::CheckViolation { .. }
            | BankError::InvalidArgument { .. } => ErrorKind::Precondition,
            BankError::Database(_)
            | BankError::Timeout(_)
            | BankError::Configuration(_)
            | BankError::InjectedFault(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably retry the same request.
    ///
    /// The ledger never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankError::SerializationFailure(_) | BankError::Timeout(_) | BankError::BeginFailed(_)
        )
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            BankError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            BankError::UserNotFound(_) => "USER_NOT_FOUND",
            BankError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            BankError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            BankError::NotFound(_) => "NOT_FOUND",
            BankError::Conflict { .. } => "CONFLICT",
            BankError::SerializationFailure(_) => "SERIALIZATION_FAILURE",
            BankError::BeginFailed(_) => "BEGIN_FAILED",
            BankError::CommitFailed(_) => "COMMIT_FAILED",
            BankError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            BankError::TransactionClosed => "TRANSACTION_CLOSED",
            BankError::SameAccount(_) => "SAME_ACCOUNT",
            BankError::InvalidAmount(_) => "INVALID_AMOUNT",
            BankError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            BankError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            BankError::CheckViolation { .. } => "CHECK_VIOLATION",
            BankError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            BankError::Database(_) => "DATABASE_ERROR",
            BankError::Timeout(_) => "TIMEOUT",
            BankError::Configuration(_) => "CONFIGURATION_ERROR",
            BankError::InjectedFault(_) => "INJECTED_FAULT",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, BankError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BankError::AccountNotFound(AccountId::new(9)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BankError::SameAccount(AccountId::new(1)).kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            BankError::CommitFailed("connection reset".into()).kind(),
            ErrorKind::Transactional
        );
        assert_eq!(
            BankError::SerializationFailure("deadlock detected".into()).kind(),
            ErrorKind::Conflict
        );
        let check = BankError::CheckViolation {
            constraint: "transfers_amount_check".into(),
            message: "amount must be positive".into(),
        };
        assert_eq!(check.kind(), ErrorKind::Precondition);
        assert!(!check.is_retryable());
        assert_eq!(check.error_code(), "CHECK_VIOLATION");
    }

    #[test]
    fn test_rollback_failure_reports_both_errors() {
        let err = BankError::RollbackFailed {
            error: Box::new(BankError::AccountNotFound(AccountId::new(7))),
            rollback: Box::new(BankError::Database("broken pipe".into())),
        };

        let message = err.to_string();
        assert!(message.contains("Account not found: 7"));
        assert!(message.contains("broken pipe"));
        assert_eq!(err.kind(), ErrorKind::Transactional);
        assert!(!err.is_retryable());
    }
}
