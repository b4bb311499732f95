//! Pending operations and retry bookkeeping
//!
//! Every non-terminal operation owns exactly one `PendingOperationRecord`,
//! keyed by a typed `TaskId`. The scheduler dispatches on the id and updates
//! the retry info after each attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::core_types::{
    DepositGroupId, RecoupGroupId, RefreshGroupId, Timestamp, WithdrawalGroupId, now,
};
use crate::error::ErrorDetail;

/// Typed identity of a schedulable operation.
///
/// The scheduler matches on this exhaustively; adding a variant without a
/// dispatch arm is a compile error, not a silently dropped task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskId {
    Withdraw(WithdrawalGroupId),
    Refresh(RefreshGroupId),
    Recoup(RecoupGroupId),
    Deposit(DepositGroupId),
    /// Keys update for one exchange, keyed by base URL.
    ExchangeUpdate(String),
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskId::Withdraw(id) => write!(f, "withdraw:{id}"),
            TaskId::Refresh(id) => write!(f, "refresh:{id}"),
            TaskId::Recoup(id) => write!(f, "recoup:{id}"),
            TaskId::Deposit(id) => write!(f, "deposit:{id}"),
            TaskId::ExchangeUpdate(url) => write!(f, "exchange-update:{url}"),
        }
    }
}

/// Exponential backoff state for one pending operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryInfo {
    pub retry_counter: u32,
    pub first_try: Timestamp,
    pub next_retry: Timestamp,
}

impl RetryInfo {
    /// Fresh retry info: due immediately.
    pub fn new() -> Self {
        let t = now();
        RetryInfo {
            retry_counter: 0,
            first_try: t,
            next_retry: t,
        }
    }

    pub fn is_due(&self, at: Timestamp) -> bool {
        self.next_retry <= at
    }

    /// Record a failed attempt: double the delay, cap it, add jitter.
    pub fn increment(&mut self, policy: &RetryConfig) {
        self.retry_counter = self.retry_counter.saturating_add(1);
        let exp = self.retry_counter.min(30);
        let raw = policy
            .base_delay_ms
            .saturating_mul(1u64 << exp.saturating_sub(1))
            .min(policy.max_delay_ms);
        let jitter_span = (raw as f64 * policy.jitter) as i64;
        let jitter = if jitter_span > 0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        let delay_ms = (raw as i64 + jitter).max(0);
        self.next_retry = now() + chrono::Duration::milliseconds(delay_ms);
    }

    /// Reset after forward progress so unrelated later failures start from
    /// the base delay again.
    pub fn reset(&mut self) {
        self.retry_counter = 0;
        self.next_retry = now();
    }
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry record persisted alongside the owning entity.
///
/// Present iff the entity is not terminal; removed on success or user cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperationRecord {
    pub id: TaskId,
    pub retry: RetryInfo,
    pub last_error: Option<ErrorDetail>,
}

impl PendingOperationRecord {
    pub fn new(id: TaskId) -> Self {
        PendingOperationRecord {
            id,
            retry: RetryInfo::new(),
            last_error: None,
        }
    }
}
