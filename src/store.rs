//! Storage access layer
//!
//! An embedded, in-memory transactional store: named collections with a
//! primary key (`BTreeMap`, so iteration order is deterministic) plus
//! accessor methods standing in for secondary indexes. Transactions take a
//! full snapshot: `run_rw` clones the collections, runs the closure on the
//! clone, and swaps it back only on success, so an error leaves no partial
//! writes behind. Closures are synchronous; suspension points live at the
//! transaction boundary, never inside one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::amounts::Amount;
use crate::core_types::{
    CoinPriv, CoinPub, DenomPubHash, DepositGroupId, RecoupGroupId, RefreshGroupId, ReservePriv,
    ReservePub, Timestamp, WithdrawalGroupId,
};
use crate::error::{ErrorDetail, WalletError};
use crate::pending::{PendingOperationRecord, TaskId};

/// Shared shape for all operation-group state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    Created,
    InProgress,
    Done,
    Failed,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupStatus::Done | GroupStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReserveState {
    /// Created locally, funding not yet confirmed.
    Created,
    /// Funds confirmed at the exchange, withdrawable.
    Funded,
    /// Fully drained. No further withdrawals are scheduled from it unless a
    /// recoup credits it again.
    Dormant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRecord {
    pub reserve_pub: ReservePub,
    pub reserve_priv: ReservePriv,
    pub exchange_base_url: String,
    pub requested_amount: Amount,
    pub state: ReserveState,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenominationRecord {
    pub exchange_base_url: String,
    pub denom_pub_hash: DenomPubHash,
    /// EdDSA verifying key of the denomination (hex).
    pub denom_pub: String,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    pub fee_refund: Amount,
    pub stamp_start: Timestamp,
    pub stamp_expire_withdraw: Timestamp,
    pub stamp_expire_deposit: Timestamp,
    pub is_revoked: bool,
}

impl DenominationRecord {
    /// Whether coins may still be minted under this denomination. A safety
    /// margin keeps us from selecting a denomination that expires mid-flight.
    pub fn is_withdrawable(&self, at: Timestamp) -> bool {
        const SAFETY_MARGIN_SECS: i64 = 300;
        !self.is_revoked
            && self.stamp_start <= at
            && at + chrono::Duration::seconds(SAFETY_MARGIN_SECS) < self.stamp_expire_withdraw
    }
}

/// Where a coin's value came from. Recoup routes restored value back here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinSource {
    Withdraw {
        reserve_pub: ReservePub,
        withdrawal_group_id: WithdrawalGroupId,
    },
    Refresh {
        refresh_group_id: RefreshGroupId,
        old_coin_pub: CoinPub,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinStatus {
    /// Spendable; `current_amount` may still be partial.
    Fresh,
    /// Zeroed by spend, refresh or recoup. Kept for audit, excluded from
    /// balance and selection.
    Dormant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinRecord {
    pub coin_pub: CoinPub,
    pub coin_priv: CoinPriv,
    pub exchange_base_url: String,
    pub denom_pub_hash: DenomPubHash,
    /// Unblinded exchange signature over the blinded envelope (hex).
    pub denom_sig: String,
    /// Blinding factor used when the envelope was formed (hex). Needed to
    /// re-derive the envelope for local verification and for recoup proofs.
    pub blinding_factor: String,
    pub current_amount: Amount,
    pub source: CoinSource,
    pub status: CoinStatus,
}

impl CoinRecord {
    pub fn is_spendable(&self) -> bool {
        self.status == CoinStatus::Fresh && !self.current_amount.is_zero()
    }
}

/// Planchet: coin material persisted before the signature request goes out.
/// Never spendable; replaced by a `CoinRecord` once the signature verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreCoinRecord {
    pub coin_pub: CoinPub,
    pub coin_priv: CoinPriv,
    pub exchange_base_url: String,
    pub denom_pub_hash: DenomPubHash,
    pub blinding_factor: String,
    /// Blinded envelope sent to the exchange (hex).
    pub blinded_envelope: String,
    pub withdrawal_group_id: WithdrawalGroupId,
    pub coin_value: Amount,
    /// First-success latch: set in the same transaction that persists the
    /// coin, checked before any re-request.
    pub withdrawal_done: bool,
    pub last_error: Option<ErrorDetail>,
}

/// One denomination picked `count` times by a selection algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenomSelItem {
    pub denom_pub_hash: DenomPubHash,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalGroupRecord {
    pub withdrawal_group_id: WithdrawalGroupId,
    pub reserve_pub: ReservePub,
    pub exchange_base_url: String,
    /// Amount to drain from the reserve, fees included.
    pub raw_amount: Amount,
    pub selected_denoms: Vec<DenomSelItem>,
    pub status: GroupStatus,
    pub last_error: Option<ErrorDetail>,
    pub timestamp_created: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshReason {
    Manual,
    /// Change left on coins after a payment.
    PayChange,
    /// Denomination close to withdraw-expiry.
    AutoExpiry,
    /// Follow-up after recouping a refresh-sourced coin.
    Recoup,
    /// Recovery of undeposited value after a failed payment.
    AbortPay,
}

/// Per-input-coin refresh session. All blinding material for the output
/// coins is derived from `transfer_secret` and the output index, so a retry
/// replays identical requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSession {
    pub old_coin_pub: CoinPub,
    /// Amount consumed from the old coin, fee included.
    pub input_amount: Amount,
    pub transfer_secret: String,
    /// One entry per output coin, in derivation-index order.
    pub new_denoms: Vec<DenomPubHash>,
    /// Set after the melt phase; reveal resumes from here.
    pub noreveal_index: Option<u32>,
    pub finished: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshGroupRecord {
    pub refresh_group_id: RefreshGroupId,
    pub exchange_base_url: String,
    pub reason: RefreshReason,
    pub sessions: Vec<RefreshSession>,
    pub status: GroupStatus,
    pub last_error: Option<ErrorDetail>,
    pub timestamp_created: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoupGroupRecord {
    pub recoup_group_id: RecoupGroupId,
    pub exchange_base_url: String,
    pub coin_pubs: Vec<CoinPub>,
    /// Parallel to `coin_pubs`.
    pub recouped: Vec<bool>,
    pub status: GroupStatus,
    pub last_error: Option<ErrorDetail>,
    pub timestamp_created: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositContribution {
    pub coin_pub: CoinPub,
    /// Gross amount deducted from the coin, deposit fee included.
    pub contribution: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositGroupRecord {
    pub deposit_group_id: DepositGroupId,
    pub merchant_base_url: String,
    /// Hash over the contract terms; permissions commit to this.
    pub contract_terms_hash: String,
    pub total_amount: Amount,
    pub contributions: Vec<DepositContribution>,
    /// Parallel to `contributions`: permission accepted by the merchant.
    pub deposited: Vec<bool>,
    pub status: GroupStatus,
    pub last_error: Option<ErrorDetail>,
    pub timestamp_created: Timestamp,
    pub timestamp_finished: Option<Timestamp>,
}

/// The named collections. Keys are primary keys; the accessor methods below
/// stand in for secondary indexes.
#[derive(Debug, Clone, Default)]
pub struct Stores {
    pub reserves: BTreeMap<ReservePub, ReserveRecord>,
    /// Keyed by (exchange base URL, denom pub hash).
    pub denominations: BTreeMap<(String, DenomPubHash), DenominationRecord>,
    pub coins: BTreeMap<CoinPub, CoinRecord>,
    pub precoins: BTreeMap<CoinPub, PreCoinRecord>,
    pub withdrawal_groups: BTreeMap<WithdrawalGroupId, WithdrawalGroupRecord>,
    pub refresh_groups: BTreeMap<RefreshGroupId, RefreshGroupRecord>,
    pub recoup_groups: BTreeMap<RecoupGroupId, RecoupGroupRecord>,
    pub deposit_groups: BTreeMap<DepositGroupId, DepositGroupRecord>,
    pub pending: BTreeMap<TaskId, PendingOperationRecord>,
}

impl Stores {
    pub fn denominations_by_exchange(&self, exchange_base_url: &str) -> Vec<&DenominationRecord> {
        self.denominations
            .values()
            .filter(|d| d.exchange_base_url == exchange_base_url)
            .collect()
    }

    pub fn get_denomination(
        &self,
        exchange_base_url: &str,
        denom_pub_hash: &str,
    ) -> Option<&DenominationRecord> {
        self.denominations
            .get(&(exchange_base_url.to_string(), denom_pub_hash.to_string()))
    }

    pub fn coins_by_exchange(&self, exchange_base_url: &str) -> Vec<&CoinRecord> {
        self.coins
            .values()
            .filter(|c| c.exchange_base_url == exchange_base_url)
            .collect()
    }

    pub fn precoins_by_group(&self, withdrawal_group_id: &str) -> Vec<&PreCoinRecord> {
        self.precoins
            .values()
            .filter(|p| p.withdrawal_group_id == withdrawal_group_id)
            .collect()
    }

    /// Due pending operations in stable key order.
    pub fn due_pending(&self, at: Timestamp) -> Vec<PendingOperationRecord> {
        self.pending
            .values()
            .filter(|p| p.retry.is_due(at))
            .cloned()
            .collect()
    }
}

/// Transactional wrapper around [`Stores`].
#[derive(Debug, Default)]
pub struct WalletDb {
    inner: Mutex<Stores>,
}

impl WalletDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only transaction.
    pub async fn run_ro<T>(
        &self,
        f: impl FnOnce(&Stores) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Read-write transaction. The closure runs on a snapshot; the snapshot
    /// replaces the live collections only when the closure returns `Ok`.
    pub async fn run_rw<T>(
        &self,
        f: impl FnOnce(&mut Stores) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let mut guard = self.inner.lock().await;
        let mut snapshot = guard.clone();
        let out = f(&mut snapshot)?;
        *guard = snapshot;
        Ok(out)
    }
}
