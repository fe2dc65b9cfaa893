use serde::{Deserialize, Serialize};

/// Machine-readable failure kind surfaced alongside every user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Pool exhausted and the acquire deadline passed; safe to retry later.
    AcquireTimeout,
    PoolClosed,
    /// Remote answered with a non-2xx status after retries.
    ApiError,
    /// Transport failed without an HTTP response after retries.
    NetworkError,
    ValidationViolation,
    TransactionNotFound,
    ActionPrecondition,
    InvalidParams,
    ValidatorRejected,
    MalformedVerdict,
    StoreError,
    NothingToUndo,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AcquireTimeout => "acquire_timeout",
            ErrorKind::PoolClosed => "pool_closed",
            ErrorKind::ApiError => "api_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ValidationViolation => "validation_violation",
            ErrorKind::TransactionNotFound => "transaction_not_found",
            ErrorKind::ActionPrecondition => "action_precondition",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::ValidatorRejected => "validator_rejected",
            ErrorKind::MalformedVerdict => "malformed_verdict",
            ErrorKind::StoreError => "store_error",
            ErrorKind::NothingToUndo => "nothing_to_undo",
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::AcquireTimeout | ErrorKind::ApiError | ErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
