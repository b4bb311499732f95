//! Recoup engine
//!
//! Runs when the exchange revokes a denomination while coins under it are
//! still live. The coin's remaining value is proven and moved back to its
//! origin: withdraw-sourced coins credit their reserve (which becomes
//! withdrawable again), refresh-sourced coins credit the coin they were
//! melted from, which is then refreshed onto healthy denominations. Recoup
//! only relocates value, never creates it.

use serde_json::json;
use tracing::{info, warn};

use crate::core_types::{CoinPub, RecoupGroupId, now};
use crate::error::WalletError;
use crate::exchange::endpoint;
use crate::memo::LockToken;
use crate::notify::NotificationType;
use crate::pending::{PendingOperationRecord, TaskId};
use crate::refresh::create_refresh_group_tx;
use crate::scheduler::TaskOutcome;
use crate::store::{CoinSource, CoinStatus, GroupStatus, RecoupGroupRecord, RefreshReason,
    ReserveState, Stores};
use crate::wallet::Wallet;

/// Canonical byte string the coin signs to prove ownership for recoup.
pub fn recoup_sig_payload(denom_pub_hash: &str, blinding_factor: &str) -> Vec<u8> {
    format!("recoup;{denom_pub_hash};{blinding_factor}").into_bytes()
}

/// Create a recoup group inside an already-open read-write transaction;
/// called from the keys update when revocations hit live coins.
pub fn create_recoup_group_tx(
    s: &mut Stores,
    exchange_base_url: &str,
    coin_pubs: Vec<CoinPub>,
) -> RecoupGroupId {
    let n = coin_pubs.len();
    let group = RecoupGroupRecord {
        recoup_group_id: uuid::Uuid::new_v4().to_string(),
        exchange_base_url: exchange_base_url.to_string(),
        coin_pubs,
        recouped: vec![false; n],
        status: GroupStatus::Created,
        last_error: None,
        timestamp_created: now(),
        timestamp_finished: None,
    };
    let id = group.recoup_group_id.clone();
    s.recoup_groups.insert(id.clone(), group);
    let task = TaskId::Recoup(id.clone());
    s.pending
        .insert(task.clone(), PendingOperationRecord::new(task));
    id
}

/// One scheduler-driven attempt to advance the group; each coin is a
/// latch-protected step.
pub async fn process_recoup_group(
    wallet: &Wallet,
    recoup_group_id: &str,
) -> Result<TaskOutcome, WalletError> {
    let id = recoup_group_id.to_string();
    let group = wallet
        .db
        .run_ro(move |s| {
            s.recoup_groups
                .get(&id)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("recoup group {id}")))
        })
        .await?;
    if group.status.is_terminal() {
        return Ok(TaskOutcome::Finished);
    }

    // Lock the exchange's coin set plus every reserve that may be credited.
    let mut tokens = vec![LockToken::ExchangeCoins(group.exchange_base_url.clone())];
    {
        let pubs = group.coin_pubs.clone();
        let reserve_tokens = wallet
            .db
            .run_ro(move |s| {
                let mut out = Vec::new();
                for cp in &pubs {
                    if let Some(c) = s.coins.get(cp) {
                        if let CoinSource::Withdraw { reserve_pub, .. } = &c.source {
                            out.push(LockToken::Reserve(reserve_pub.clone()));
                        }
                    }
                }
                Ok(out)
            })
            .await?;
        tokens.extend(reserve_tokens);
    }
    let _guard = wallet.locks.acquire(tokens).await;

    {
        let gid = group.recoup_group_id.clone();
        wallet
            .db
            .run_rw(move |s| {
                if let Some(g) = s.recoup_groups.get_mut(&gid) {
                    if g.status == GroupStatus::Created {
                        g.status = GroupStatus::InProgress;
                    }
                }
                Ok(())
            })
            .await?;
    }

    for (idx, coin_pub) in group.coin_pubs.iter().enumerate() {
        if group.recouped[idx] {
            continue;
        }
        recoup_coin(wallet, &group, idx, coin_pub).await?;
    }

    let gid = group.recoup_group_id.clone();
    let done = wallet
        .db
        .run_rw(move |s| {
            let Some(g) = s.recoup_groups.get_mut(&gid) else {
                return Ok(false);
            };
            if g.recouped.iter().all(|r| *r) {
                g.status = GroupStatus::Done;
                g.timestamp_finished = Some(now());
                return Ok(true);
            }
            Ok(false)
        })
        .await?;
    if done {
        info!(recoup_group_id = %group.recoup_group_id, "recoup group finished");
        wallet.notifier.notify(NotificationType::RecoupFinished {
            recoup_group_id: group.recoup_group_id.clone(),
        });
        Ok(TaskOutcome::Finished)
    } else {
        Ok(TaskOutcome::Pending)
    }
}

async fn recoup_coin(
    wallet: &Wallet,
    group: &RecoupGroupRecord,
    idx: usize,
    coin_pub: &str,
) -> Result<(), WalletError> {
    let cp = coin_pub.to_string();
    let coin = wallet
        .db
        .run_ro(move |s| {
            s.coins
                .get(&cp)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("coin {cp}")))
        })
        .await?;

    let payload = recoup_sig_payload(&coin.denom_pub_hash, &coin.blinding_factor);
    let coin_sig = wallet.crypto.eddsa_sign(&coin.coin_priv, &payload).await?;
    let url = endpoint(
        &group.exchange_base_url,
        &format!("coins/{coin_pub}/recoup"),
    );
    let resp = wallet
        .http
        .post_json(
            &url,
            &json!({
                "denom_pub_hash": coin.denom_pub_hash,
                "coin_blind": coin.blinding_factor,
                "coin_sig": coin_sig,
            }),
        )
        .await?;
    if !resp.is_ok() {
        return Err(resp.into_server_error());
    }

    let gid = group.recoup_group_id.clone();
    let exchange = group.exchange_base_url.clone();
    let cp = coin_pub.to_string();
    let credited = wallet
        .db
        .run_rw(move |s| {
            let g = s
                .recoup_groups
                .get_mut(&gid)
                .ok_or_else(|| WalletError::NotFound(format!("recoup group {gid}")))?;
            if g.recouped[idx] {
                return Ok(false);
            }
            g.recouped[idx] = true;

            let coin = s
                .coins
                .get_mut(&cp)
                .ok_or_else(|| WalletError::NotFound(format!("coin {cp}")))?;
            let amount = coin.current_amount.clone();
            coin.current_amount = crate::amounts::Amount::zero(&amount.currency);
            coin.status = CoinStatus::Dormant;
            let source = coin.source.clone();

            match source {
                CoinSource::Withdraw { reserve_pub, .. } => {
                    let r = s.reserves.get_mut(&reserve_pub).ok_or_else(|| {
                        WalletError::NotFound(format!("reserve {reserve_pub}"))
                    })?;
                    // Several coins of one group may credit the same
                    // reserve; the credits accumulate.
                    r.requested_amount = if r.state == ReserveState::Funded {
                        r.requested_amount.checked_add(&amount)?
                    } else {
                        amount
                    };
                    r.state = ReserveState::Funded;
                }
                CoinSource::Refresh { old_coin_pub, .. } => {
                    let old = s.coins.get_mut(&old_coin_pub).ok_or_else(|| {
                        WalletError::NotFound(format!("coin {old_coin_pub}"))
                    })?;
                    old.current_amount = old.current_amount.checked_add(&amount)?;
                    old.status = CoinStatus::Fresh;
                    let input = old.current_amount.clone();
                    create_refresh_group_tx(
                        s,
                        &exchange,
                        vec![(old_coin_pub, input)],
                        RefreshReason::Recoup,
                    )?;
                }
            }
            Ok(true)
        })
        .await?;
    if credited {
        warn!(coin_pub, "coin recouped, value returned to origin");
        wallet.notifier.notify(NotificationType::BalanceChange);
        wallet.wake_task_loop();
    }
    Ok(())
}
