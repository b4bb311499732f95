//! Retry scheduler
//!
//! Drives every pending operation to completion or to a recorded,
//! backed-off failure. One loop per wallet: collect due retry records,
//! dispatch each to its engine through the memo map, write the outcome
//! back. The loop sleeps until the earliest retry deadline and can be
//! woken early; `stop()` exits promptly, leaving transactions as the unit
//! of atomicity.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::core_types::now;
use crate::deposit;
use crate::error::{ErrorDetail, WalletError};
use crate::exchange;
use crate::notify::NotificationType;
use crate::pending::TaskId;
use crate::recoup;
use crate::refresh;
use crate::store::{GroupStatus, Stores};
use crate::wallet::Wallet;
use crate::withdraw;

/// What an engine attempt achieved. `Pending` means forward progress was
/// made but the operation is not terminal yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    Pending,
}

#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    /// Abort the loop with an error once any task has failed this often.
    pub max_retries: Option<u32>,
    /// Exit when no pending operation remains (batch mode) instead of
    /// blocking for new work (interactive mode).
    pub exit_when_idle: bool,
}

/// Run one task, deduplicated against concurrent invocations for the same
/// id through the memo map.
pub async fn process_task(
    wallet: Arc<Wallet>,
    task: TaskId,
) -> Result<TaskOutcome, WalletError> {
    let w = wallet.clone();
    let t = task.clone();
    wallet.memo.memoized(task, move || dispatch(w, t)).await
}

async fn dispatch(wallet: Arc<Wallet>, task: TaskId) -> Result<TaskOutcome, WalletError> {
    debug!(task = %task, "dispatching");
    match &task {
        TaskId::Withdraw(id) => withdraw::process_withdrawal_group(&wallet, id).await,
        TaskId::Refresh(id) => refresh::process_refresh_group(&wallet, id).await,
        TaskId::Recoup(id) => recoup::process_recoup_group(&wallet, id).await,
        TaskId::Deposit(id) => deposit::process_deposit_group(&wallet, id).await,
        TaskId::ExchangeUpdate(url) => exchange::update_exchange_keys(&wallet, url).await,
    }
}

/// Terminal failure: mark the owning entity, drop the retry record. For a
/// deposit group the value the merchant never accepted is recovered in the
/// same transaction.
fn mark_task_failed(s: &mut Stores, task: &TaskId, detail: ErrorDetail) -> Result<(), WalletError> {
    match task {
        TaskId::Withdraw(id) => {
            if let Some(g) = s.withdrawal_groups.get_mut(id) {
                g.status = GroupStatus::Failed;
                g.last_error = Some(detail);
                g.timestamp_finished = Some(now());
            }
        }
        TaskId::Refresh(id) => {
            if let Some(g) = s.refresh_groups.get_mut(id) {
                g.status = GroupStatus::Failed;
                g.last_error = Some(detail);
                g.timestamp_finished = Some(now());
            }
        }
        TaskId::Recoup(id) => {
            if let Some(g) = s.recoup_groups.get_mut(id) {
                g.status = GroupStatus::Failed;
                g.last_error = Some(detail);
                g.timestamp_finished = Some(now());
            }
        }
        TaskId::Deposit(id) => {
            deposit::abort_deposit_group_tx(s, id, detail)?;
        }
        TaskId::ExchangeUpdate(_) => {}
    }
    s.pending.remove(task);
    Ok(())
}

/// Forward progress resets the backoff: the next attempt comes after the
/// base delay, not the accumulated one.
fn note_progress(s: &mut Stores, task: &TaskId, policy: &RetryConfig) {
    if let Some(p) = s.pending.get_mut(task) {
        p.retry.reset();
        p.retry.increment(policy);
    }
}

pub async fn run_task_loop(wallet: Arc<Wallet>, cfg: RunConfig) -> Result<(), WalletError> {
    info!(?cfg, "task loop started");
    loop {
        if wallet.is_stopped() {
            break;
        }
        let due = wallet.db.run_ro(|s| Ok(s.due_pending(now()))).await?;
        if due.is_empty() {
            let deadlines = wallet
                .db
                .run_ro(|s| {
                    Ok(s.pending
                        .values()
                        .map(|p| p.retry.next_retry)
                        .collect::<Vec<_>>())
                })
                .await?;
            let Some(earliest) = deadlines.into_iter().min() else {
                if cfg.exit_when_idle {
                    break;
                }
                wallet.wake.notified().await;
                continue;
            };
            let wait = (earliest - now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = wallet.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        for rec in due {
            if wallet.is_stopped() {
                break;
            }
            if let Some(max) = cfg.max_retries {
                if rec.retry.retry_counter >= max {
                    error!(task = %rec.id, retries = rec.retry.retry_counter, "giving up");
                    return Err(WalletError::Internal(format!(
                        "task {} exceeded {} retries, last error: {:?}",
                        rec.id, max, rec.last_error
                    )));
                }
            }
            let task = rec.id.clone();
            match process_task(wallet.clone(), task.clone()).await {
                Ok(TaskOutcome::Finished) => {
                    let t = task.clone();
                    wallet
                        .db
                        .run_rw(move |s| {
                            s.pending.remove(&t);
                            Ok(())
                        })
                        .await?;
                    wallet
                        .notifier
                        .notify(NotificationType::PendingProcessed { task });
                }
                Ok(TaskOutcome::Pending) => {
                    let t = task.clone();
                    let policy = wallet.config.retry.clone();
                    wallet
                        .db
                        .run_rw(move |s| {
                            note_progress(s, &t, &policy);
                            Ok(())
                        })
                        .await?;
                }
                Err(e) => {
                    let detail = ErrorDetail::from_error(&e);
                    wallet.notifier.notify(NotificationType::OperationError {
                        task: task.clone(),
                        error: detail.clone(),
                    });
                    if e.is_retryable() {
                        warn!(task = %task, error = %e, "attempt failed, backing off");
                        let t = task.clone();
                        let policy = wallet.config.retry.clone();
                        wallet
                            .db
                            .run_rw(move |s| {
                                if let Some(p) = s.pending.get_mut(&t) {
                                    p.retry.increment(&policy);
                                    p.last_error = Some(detail);
                                }
                                Ok(())
                            })
                            .await?;
                    } else {
                        error!(task = %task, error = %e, "terminal failure");
                        let t = task.clone();
                        wallet
                            .db
                            .run_rw(move |s| mark_task_failed(s, &t, detail))
                            .await?;
                    }
                }
            }
        }
    }
    info!("task loop exited");
    Ok(())
}
