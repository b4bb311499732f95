//! Change notifications
//!
//! Engines emit an event right after the transaction that caused it
//! commits, so delivery order matches commit order. Delivery is
//! fire-and-forget over a broadcast channel; a missing or slow listener
//! never blocks the money path.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ErrorDetail;
use crate::pending::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NotificationType {
    CoinWithdrawn {
        coin_pub: String,
    },
    WithdrawGroupFinished {
        withdrawal_group_id: String,
    },
    RefreshMelted {
        refresh_group_id: String,
    },
    RefreshRevealed {
        refresh_group_id: String,
    },
    RecoupFinished {
        recoup_group_id: String,
    },
    DepositFinished {
        deposit_group_id: String,
    },
    BalanceChange,
    OperationError {
        task: TaskId,
        error: ErrorDetail,
    },
    PendingProcessed {
        task: TaskId,
    },
}

#[derive(Debug)]
pub struct Notifier {
    tx: broadcast::Sender<NotificationType>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Notifier { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationType> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: NotificationType) {
        tracing::trace!(?event, "notify");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
