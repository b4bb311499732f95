//! Wallet error types
//!
//! The taxonomy matters more than the concrete type: network failures and
//! transient server errors are retryable with backoff, protocol violations
//! and invariant breaks are terminal and surfaced loudly, insufficient funds
//! is user-correctable and never retried automatically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amounts::AmountError;

/// Wallet error taxonomy.
///
/// Engines catch recoverable errors and record them on the owning entity;
/// only protocol violations and unexpected exceptions propagate to the
/// scheduler, which records them and never crashes the process.
#[derive(Error, Debug, Clone)]
pub enum WalletError {
    // === Retryable ===
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The counterparty rejected the request. Retryable only when the
    /// status indicates a transient condition (5xx, 429).
    #[error("Server error (status {status}): {detail}")]
    Server { status: u16, detail: String },

    // === Terminal ===
    /// Cryptographic verification failed, an amount invariant broke, or a
    /// response was structurally malformed. Never silently retried.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: String,
        available: String,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Stable error code, persisted on pending-operation records and shown
    /// in transaction histories.
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::Network(_) => "NETWORK_ERROR",
            WalletError::Timeout(_) => "TIMEOUT",
            WalletError::Server { .. } => "SERVER_ERROR",
            WalletError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            WalletError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WalletError::NotFound(_) => "NOT_FOUND",
            WalletError::InvalidRequest(_) => "INVALID_REQUEST",
            WalletError::Database(_) => "DATABASE_ERROR",
            WalletError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the scheduler should retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            WalletError::Network(_) | WalletError::Timeout(_) => true,
            WalletError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<AmountError> for WalletError {
    fn from(e: AmountError) -> Self {
        // Amount arithmetic on the money path only fails when an invariant
        // already broke (mismatched currency, conservation underflow).
        WalletError::ProtocolViolation(e.to_string())
    }
}

impl From<anyhow::Error> for WalletError {
    fn from(e: anyhow::Error) -> Self {
        WalletError::Internal(format!("{e:#}"))
    }
}

/// Persisted form of an error, stored on pending-operation records so the
/// UI can show failed-with-reason state across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn from_error(e: &WalletError) -> Self {
        ErrorDetail {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}
