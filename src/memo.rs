//! Operation memoization and lock table
//!
//! Both structures are process-local and rebuilt empty on restart; durable
//! state lives in the store only.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::WalletError;
use crate::pending::TaskId;

/// At-most-one in-flight computation per task id. A second caller for the
/// same id awaits the first caller's outcome instead of re-running the
/// closure; the entry is removed when the computation completes.
pub struct AsyncMemoMap<T: Clone> {
    inflight: DashMap<TaskId, Shared<BoxFuture<'static, Result<T, WalletError>>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncMemoMap<T> {
    pub fn new() -> Self {
        AsyncMemoMap {
            inflight: DashMap::new(),
        }
    }

    pub async fn memoized<F, Fut>(&self, key: TaskId, f: F) -> Result<T, WalletError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WalletError>> + Send + 'static,
    {
        let (fut, is_owner) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(v) => {
                let shared = f().boxed().shared();
                v.insert(shared.clone());
                (shared, true)
            }
        };
        let out = fut.await;
        if is_owner {
            self.inflight.remove(&key);
        }
        out
    }

    pub fn in_flight(&self, key: &TaskId) -> bool {
        self.inflight.contains_key(key)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for AsyncMemoMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resources whose mutating sections must not interleave. The derived
/// `Ord` gives the fixed global acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockToken {
    /// All coins at one exchange (selection and spend).
    ExchangeCoins(String),
    /// One reserve (withdrawal, recoup credit).
    Reserve(String),
}

/// Held for the duration of a locked section; dropping releases every lock.
pub struct LockGuards {
    _guards: Vec<OwnedMutexGuard<()>>,
}

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<LockToken, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire all tokens, sorted and deduplicated first so that any two
    /// callers take overlapping tokens in the same order.
    pub async fn acquire(&self, mut tokens: Vec<LockToken>) -> LockGuards {
        tokens.sort();
        tokens.dedup();
        let mut guards = Vec::with_capacity(tokens.len());
        for token in tokens {
            let mutex = { self.locks.entry(token).or_default().value().clone() };
            guards.push(mutex.lock_owned().await);
        }
        LockGuards { _guards: guards }
    }
}
