//! Typed error kinds for the execution/broker/store boundary.
//!
//! Everything else in the crate returns `anyhow::Result`; these enums exist
//! specifically where a caller needs to branch on the *kind* of failure
//! (retry transient errors, never retry policy rejections, re-login once on
//! auth errors) per the propagation policy.

use thiserror::Error;

/// Errors surfaced by a `BrokerAdapter` implementation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("transient transport error: {0}")]
    Transport(String),
    #[error("broker api error: {0}")]
    Api(String),
}

impl BrokerError {
    /// Transient errors (transport, rate limit) are retried with bounded
    /// backoff by the adapter itself; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::RateLimited { .. })
    }
}

/// Errors surfaced by a `HistoricalBarStore` implementation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("corrupt record skipped: {0}")]
    Corruption(String),
}

/// Rejection kind attached to an execution-path failure, used so the
/// router/ledger can record a stable reason code independent of the
/// human-readable message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    #[error("validation")]
    Validation,
    #[error("policy")]
    Policy,
    #[error("transient")]
    Transient,
    #[error("rate_limited")]
    RateLimited,
    #[error("auth")]
    Auth,
    #[error("broker_rejected")]
    BrokerRejected,
    #[error("io")]
    Io,
    #[error("drift")]
    Drift,
    #[error("corruption")]
    Corruption,
}

#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
