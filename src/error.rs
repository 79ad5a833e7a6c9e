use crate::domain::session::SessionStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid split: mentor {mentor} + platform {platform} != total {total}")]
    InvalidSplit {
        total: i64,
        mentor: i64,
        platform: i64,
    },
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },
    #[error("Amount mismatch for session {session}: expected {expected}, got {actual}")]
    AmountMismatch {
        session: String,
        expected: i64,
        actual: i64,
    },
    #[error(
        "Refund exceeds capture for session {session}: {bucket} captured {captured}, already refunded {refunded}, requested {requested}"
    )]
    RefundExceedsCapture {
        session: String,
        bucket: &'static str,
        captured: i64,
        refunded: i64,
        requested: i64,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    pub(crate) fn session_transition(session: &str, from: SessionStatus, to: SessionStatus) -> Self {
        Self::InvalidTransition {
            subject: format!("session {}", session),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Transient failures the caller may retry as a whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(err: rocksdb::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}
