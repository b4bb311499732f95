//! Wallet context and command API
//!
//! One `Wallet` per instance, no process-wide state. UI/CLI layers attach
//! at the command methods; everything they trigger runs through the store,
//! the facades and the scheduler owned by this context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::info;

use crate::amounts::Amount;
use crate::balance::{Balance, get_balances};
use crate::config::WalletConfig;
use crate::core_types::{DepositGroupId, RefreshGroupId, ReservePub, WithdrawalGroupId, now};
use crate::crypto::CryptoFacade;
use crate::deposit;
use crate::error::WalletError;
use crate::http::HttpFacade;
use crate::memo::{AsyncMemoMap, LockTable};
use crate::notify::{NotificationType, Notifier};
use crate::pending::{PendingOperationRecord, TaskId};
use crate::refresh;
use crate::scheduler::{self, RunConfig, TaskOutcome};
use crate::store::{ReserveRecord, ReserveState, WalletDb};
use crate::withdraw;

/// Payment request as handed over by the UI layer.
#[derive(Debug, Clone)]
pub struct PayRequest {
    pub merchant_base_url: String,
    pub amount: Amount,
    /// Canonical serialization of the contract terms; the wallet commits to
    /// its hash, never to the raw document.
    pub contract_terms: serde_json::Value,
}

pub struct Wallet {
    pub config: WalletConfig,
    pub db: WalletDb,
    pub http: Arc<dyn HttpFacade>,
    pub crypto: Arc<dyn CryptoFacade>,
    pub locks: LockTable,
    pub memo: AsyncMemoMap<TaskOutcome>,
    pub notifier: Notifier,
    /// Wakes the task loop early when new work arrives.
    pub wake: Notify,
    stopped: AtomicBool,
}

impl Wallet {
    pub fn new(
        config: WalletConfig,
        http: Arc<dyn HttpFacade>,
        crypto: Arc<dyn CryptoFacade>,
    ) -> Arc<Self> {
        Arc::new(Wallet {
            config,
            db: WalletDb::new(),
            http,
            crypto,
            locks: LockTable::new(),
            memo: AsyncMemoMap::new(),
            notifier: Notifier::new(),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NotificationType> {
        self.notifier.subscribe()
    }

    /// Signal the task loop that new pending work exists.
    pub fn wake_task_loop(&self) {
        self.wake.notify_waiters();
    }

    /// Prevent new operations from starting. In-flight transactions finish
    /// or abort on their own; partial sub-state stays in the store for
    /// later resumption.
    pub fn stop(&self) {
        info!("wallet stop requested");
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Create a reserve at an exchange. The caller funds it out of band and
    /// then calls [`Wallet::acknowledge_reserve_funded`].
    pub async fn create_reserve(
        &self,
        exchange_base_url: &str,
        requested_amount: Amount,
    ) -> Result<ReservePub, WalletError> {
        let kp = self.crypto.create_eddsa_keypair().await?;
        let record = ReserveRecord {
            reserve_pub: kp.pub_hex.clone(),
            reserve_priv: kp.priv_hex,
            exchange_base_url: exchange_base_url.to_string(),
            requested_amount,
            state: ReserveState::Created,
            created_at: now(),
        };
        self.db
            .run_rw(|s| {
                s.reserves.insert(record.reserve_pub.clone(), record.clone());
                Ok(())
            })
            .await?;
        info!(reserve_pub = %kp.pub_hex, exchange_base_url, "reserve created");
        Ok(kp.pub_hex)
    }

    /// Mark a reserve as funded at the exchange, making it withdrawable.
    pub async fn acknowledge_reserve_funded(
        &self,
        reserve_pub: &str,
    ) -> Result<(), WalletError> {
        let reserve_pub = reserve_pub.to_string();
        self.db
            .run_rw(move |s| {
                let r = s
                    .reserves
                    .get_mut(&reserve_pub)
                    .ok_or_else(|| WalletError::NotFound(format!("reserve {reserve_pub}")))?;
                if r.state == ReserveState::Created {
                    r.state = ReserveState::Funded;
                }
                Ok(())
            })
            .await
    }

    /// Start withdrawing the reserve's requested amount into coins.
    pub async fn withdraw(
        &self,
        reserve_pub: &str,
    ) -> Result<WithdrawalGroupId, WalletError> {
        let id = withdraw::create_withdrawal_group(self, reserve_pub).await?;
        self.wake_task_loop();
        Ok(id)
    }

    /// Start refreshing the full remaining value of the given coins.
    pub async fn refresh_coins(
        &self,
        exchange_base_url: &str,
        coin_pubs: &[String],
    ) -> Result<RefreshGroupId, WalletError> {
        let id = refresh::start_manual_refresh(self, exchange_base_url, coin_pubs).await?;
        self.wake_task_loop();
        Ok(id)
    }

    /// Pay a merchant: select coins, apply the spend and queue the deposit.
    pub async fn create_deposit_group(
        &self,
        req: PayRequest,
    ) -> Result<DepositGroupId, WalletError> {
        let id = deposit::create_deposit_group(self, req).await?;
        self.wake_task_loop();
        Ok(id)
    }

    /// Queue a keys update for an exchange (first contact, or polling for
    /// revocations).
    pub async fn update_exchange(&self, exchange_base_url: &str) -> Result<(), WalletError> {
        let task = TaskId::ExchangeUpdate(exchange_base_url.to_string());
        self.db
            .run_rw(move |s| {
                s.pending
                    .entry(task.clone())
                    .or_insert_with(|| PendingOperationRecord::new(task));
                Ok(())
            })
            .await?;
        self.wake_task_loop();
        Ok(())
    }

    /// Abort one scheduled operation. Only the retry record is removed, so
    /// the task loop stops driving it; the owning entity's partial state
    /// stays in the store for [`Wallet::resume_pending`] or inspection.
    pub async fn cancel_pending(&self, task: &TaskId) -> Result<(), WalletError> {
        let t = task.clone();
        self.db
            .run_rw(move |s| {
                if s.pending.remove(&t).is_none() {
                    return Err(WalletError::NotFound(format!("pending operation {t}")));
                }
                Ok(())
            })
            .await?;
        info!(task = %task, "pending operation cancelled");
        Ok(())
    }

    /// Re-queue a previously cancelled operation. The owning entity must
    /// still exist and not be terminal; processing resumes from its
    /// persisted sub-state.
    pub async fn resume_pending(&self, task: &TaskId) -> Result<(), WalletError> {
        let task = task.clone();
        self.db
            .run_rw(move |s| {
                let resumable = match &task {
                    TaskId::Withdraw(id) => s
                        .withdrawal_groups
                        .get(id)
                        .is_some_and(|g| !g.status.is_terminal()),
                    TaskId::Refresh(id) => s
                        .refresh_groups
                        .get(id)
                        .is_some_and(|g| !g.status.is_terminal()),
                    TaskId::Recoup(id) => s
                        .recoup_groups
                        .get(id)
                        .is_some_and(|g| !g.status.is_terminal()),
                    TaskId::Deposit(id) => s
                        .deposit_groups
                        .get(id)
                        .is_some_and(|g| !g.status.is_terminal()),
                    TaskId::ExchangeUpdate(_) => true,
                };
                if !resumable {
                    return Err(WalletError::InvalidRequest(format!(
                        "operation {task} is finished or unknown"
                    )));
                }
                s.pending
                    .entry(task.clone())
                    .or_insert_with(|| PendingOperationRecord::new(task.clone()));
                Ok(())
            })
            .await?;
        self.wake_task_loop();
        Ok(())
    }

    pub async fn get_balances(&self) -> Result<Vec<Balance>, WalletError> {
        get_balances(self).await
    }

    pub async fn get_pending_operations(
        &self,
    ) -> Result<Vec<PendingOperationRecord>, WalletError> {
        self.db
            .run_ro(|s| Ok(s.pending.values().cloned().collect()))
            .await
    }

    /// Drive all pending operations to a terminal state. Fails if any
    /// operation exceeds `max_retries` attempts.
    pub async fn run_until_done(self: &Arc<Self>, max_retries: u32) -> Result<(), WalletError> {
        scheduler::run_task_loop(
            self.clone(),
            RunConfig {
                max_retries: Some(max_retries),
                exit_when_idle: true,
            },
        )
        .await
    }

    /// Long-running task loop for interactive use; exits on [`Wallet::stop`].
    pub async fn run_task_loop(self: &Arc<Self>) -> Result<(), WalletError> {
        scheduler::run_task_loop(
            self.clone(),
            RunConfig {
                max_retries: None,
                exit_when_idle: false,
            },
        )
        .await
    }
}
