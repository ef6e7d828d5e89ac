//! Error types for ledger operations.

use crate::{AccountId, Money, MoneyError, SettlementId};
use thiserror::Error;

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed or out-of-range amount, or a transfer to the same account.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Empty or malformed account / settlement identifier.
    #[error("Invalid {kind} id: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// Debit would take the account below zero.
    #[error("Insufficient funds in {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        required: Money,
        available: Money,
    },

    /// Settlement could not be applied; the transaction was rolled back.
    #[error("Settlement {settlement_id} failed: {reason}")]
    SettlementFailed {
        settlement_id: SettlementId,
        reason: String,
    },

    /// Durable store unreachable or busy. Nothing was committed.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Ledger entry id collision.
    #[error("Duplicate ledger entry: {0}")]
    DuplicateEntry(String),

    /// A transfer idempotency key was presented again with different parameters.
    #[error("Idempotency key {0:?} was already used for a different transfer")]
    IdempotencyKeyReused(String),

    /// Operation deadline elapsed.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fault outside the store, such as a result that could not be encoded.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Check if this error is retryable without knowing whether anything committed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StorageUnavailable(_))
    }

    /// Stable error code for callers and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::SettlementFailed { .. } => "SETTLEMENT_FAILED",
            LedgerError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            LedgerError::DuplicateEntry(_) => "DUPLICATE_ENTRY",
            LedgerError::IdempotencyKeyReused(_) => "IDEMPOTENCY_KEY_REUSED",
            LedgerError::Timeout(_) => "TIMEOUT",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure points at a broken ledger invariant and should page someone.
    pub fn requires_alert(&self) -> bool {
        matches!(self, LedgerError::DuplicateEntry(_))
    }
}

impl From<MoneyError> for LedgerError {
    fn from(err: MoneyError) -> Self {
        LedgerError::InvalidAmount(err.to_string())
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
