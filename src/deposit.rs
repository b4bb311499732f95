//! Deposit / pay engine
//!
//! Paying a merchant selects a covering coin set and applies the spend in
//! the same transaction that creates the deposit group, so a coin's value
//! can never be promised twice. Submission happens afterwards and is
//! resumable: permissions are re-derived from the persisted contributions,
//! never re-selected.

use serde_json::json;
use tracing::{debug, info};

use crate::amounts::Amount;
use crate::core_types::DepositGroupId;
use crate::core_types::now;
use crate::crypto::hash_hex;
use crate::error::{ErrorDetail, WalletError};
use crate::exchange::endpoint;
use crate::memo::LockToken;
use crate::notify::NotificationType;
use crate::pending::{PendingOperationRecord, TaskId};
use crate::refresh::create_refresh_group_tx;
use crate::scheduler::TaskOutcome;
use crate::store::{
    CoinRecord, CoinStatus, DepositContribution, DepositGroupRecord, GroupStatus, RefreshReason,
    Stores,
};
use crate::wallet::{PayRequest, Wallet};

/// Canonical byte string a coin signs to authorize one deposit permission.
pub fn deposit_sig_payload(
    contract_terms_hash: &str,
    coin_pub: &str,
    contribution: &Amount,
) -> Vec<u8> {
    format!("deposit;{contract_terms_hash};{coin_pub};{contribution}").into_bytes()
}

/// Hash of the canonical contract-terms serialization. `serde_json` keeps
/// object keys sorted, so equal terms hash equally.
pub fn contract_terms_hash(terms: &serde_json::Value) -> String {
    hash_hex(terms.to_string().as_bytes())
}

/// Greedy pay-coin selection: largest remaining value first, ties broken
/// on `coin_pub`. Each candidate carries its denomination's deposit fee;
/// a coin contributes its fee plus whatever net value is still needed, up
/// to its remaining amount.
pub fn select_pay_coins(
    candidates: &[(CoinRecord, Amount)],
    amount: &Amount,
) -> Result<Vec<DepositContribution>, WalletError> {
    let mut sorted: Vec<&(CoinRecord, Amount)> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        b.0.current_amount
            .cmp_value(&a.0.current_amount)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.coin_pub.cmp(&b.0.coin_pub))
    });

    let mut needed = amount.clone();
    let mut usable_total = Amount::zero(&amount.currency);
    let mut contributions = Vec::new();
    for (coin, fee_deposit) in sorted {
        // Net value this coin can add after its deposit fee.
        let max_net = match coin.current_amount.checked_sub(fee_deposit) {
            Ok(n) if !n.is_zero() => n,
            _ => continue,
        };
        usable_total = usable_total.checked_add(&max_net)?;
        if needed.is_zero() {
            continue;
        }
        let net = if max_net.cmp_value(&needed)? == std::cmp::Ordering::Less {
            max_net
        } else {
            needed.clone()
        };
        let gross = net.checked_add(fee_deposit)?;
        contributions.push(DepositContribution {
            coin_pub: coin.coin_pub.clone(),
            contribution: gross,
        });
        needed = needed.checked_sub(&net)?;
    }
    if !needed.is_zero() {
        return Err(WalletError::InsufficientFunds {
            requested: amount.to_string(),
            available: usable_total.to_string(),
        });
    }
    Ok(contributions)
}

/// Select coins, apply the spend and queue the submission, all in one
/// commit. Change left on partially spent coins is captured into a refresh
/// group in the same transaction.
pub async fn create_deposit_group(
    wallet: &Wallet,
    req: PayRequest,
) -> Result<DepositGroupId, WalletError> {
    let currency = req.amount.currency.clone();
    let exchanges = wallet
        .db
        .run_ro(move |s| {
            let mut urls: Vec<String> = s
                .coins
                .values()
                .filter(|c| c.is_spendable() && c.current_amount.currency == currency)
                .map(|c| c.exchange_base_url.clone())
                .collect();
            urls.sort();
            urls.dedup();
            Ok(urls)
        })
        .await?;
    let _guard = wallet
        .locks
        .acquire(exchanges.iter().cloned().map(LockToken::ExchangeCoins).collect())
        .await;

    let terms_hash = contract_terms_hash(&req.contract_terms);
    let deposit_group_id = uuid::Uuid::new_v4().to_string();
    let id_for_tx = deposit_group_id.clone();
    wallet
        .db
        .run_rw(move |s| {
            let mut candidates = Vec::new();
            for c in s.coins.values() {
                if !c.is_spendable() || c.current_amount.currency != req.amount.currency {
                    continue;
                }
                let Some(d) = s.get_denomination(&c.exchange_base_url, &c.denom_pub_hash) else {
                    continue;
                };
                if d.is_revoked {
                    continue;
                }
                candidates.push((c.clone(), d.fee_deposit.clone()));
            }
            let contributions = select_pay_coins(&candidates, &req.amount)?;

            // Apply the spend and collect change per exchange.
            let mut change: std::collections::BTreeMap<String, Vec<(String, Amount)>> =
                std::collections::BTreeMap::new();
            for contrib in &contributions {
                let coin = s
                    .coins
                    .get_mut(&contrib.coin_pub)
                    .ok_or_else(|| WalletError::NotFound(format!("coin {}", contrib.coin_pub)))?;
                coin.current_amount = coin.current_amount.checked_sub(&contrib.contribution)?;
                if coin.current_amount.is_zero() {
                    coin.status = CoinStatus::Dormant;
                } else {
                    change
                        .entry(coin.exchange_base_url.clone())
                        .or_default()
                        .push((coin.coin_pub.clone(), coin.current_amount.clone()));
                }
            }
            for (exchange, inputs) in change {
                create_refresh_group_tx(s, &exchange, inputs, RefreshReason::PayChange)?;
            }

            let n = contributions.len();
            let group = DepositGroupRecord {
                deposit_group_id: id_for_tx.clone(),
                merchant_base_url: req.merchant_base_url.clone(),
                contract_terms_hash: terms_hash,
                total_amount: req.amount.clone(),
                contributions,
                deposited: vec![false; n],
                status: GroupStatus::Created,
                last_error: None,
                timestamp_created: now(),
                timestamp_finished: None,
            };
            s.deposit_groups.insert(id_for_tx.clone(), group);
            let task = TaskId::Deposit(id_for_tx.clone());
            s.pending
                .insert(task.clone(), PendingOperationRecord::new(task));
            Ok(())
        })
        .await?;
    info!(deposit_group_id = %deposit_group_id, "deposit group created, coins spent");
    wallet.notifier.notify(NotificationType::BalanceChange);
    Ok(deposit_group_id)
}

/// One scheduler-driven attempt to submit the remaining permissions.
pub async fn process_deposit_group(
    wallet: &Wallet,
    deposit_group_id: &str,
) -> Result<TaskOutcome, WalletError> {
    let id = deposit_group_id.to_string();
    let group = wallet
        .db
        .run_ro(move |s| {
            s.deposit_groups
                .get(&id)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("deposit group {id}")))
        })
        .await?;
    if group.status.is_terminal() {
        return Ok(TaskOutcome::Finished);
    }

    if group.status == GroupStatus::Created {
        let gid = group.deposit_group_id.clone();
        wallet
            .db
            .run_rw(move |s| {
                if let Some(g) = s.deposit_groups.get_mut(&gid) {
                    g.status = GroupStatus::InProgress;
                }
                Ok(())
            })
            .await?;
    }

    for (idx, contrib) in group.contributions.iter().enumerate() {
        if group.deposited[idx] {
            continue;
        }
        submit_permission(wallet, &group, idx, contrib).await?;
    }

    let gid = group.deposit_group_id.clone();
    wallet
        .db
        .run_rw(move |s| {
            if let Some(g) = s.deposit_groups.get_mut(&gid) {
                g.status = GroupStatus::Done;
                g.timestamp_finished = Some(now());
            }
            Ok(())
        })
        .await?;
    info!(deposit_group_id = %group.deposit_group_id, "deposit group finished");
    wallet.notifier.notify(NotificationType::DepositFinished {
        deposit_group_id: group.deposit_group_id.clone(),
    });
    Ok(TaskOutcome::Finished)
}

/// Terminal payment failure: mark the group failed and move the value of
/// every contribution the merchant never accepted back onto the coins, then
/// refresh it onto fresh ones. Runs inside the scheduler's failure
/// transaction so the group state and the recovery commit together.
pub fn abort_deposit_group_tx(
    s: &mut Stores,
    deposit_group_id: &str,
    detail: ErrorDetail,
) -> Result<(), WalletError> {
    let Some(g) = s.deposit_groups.get_mut(deposit_group_id) else {
        return Ok(());
    };
    if g.status.is_terminal() {
        return Ok(());
    }
    g.status = GroupStatus::Failed;
    g.last_error = Some(detail);
    g.timestamp_finished = Some(now());
    let leftovers: Vec<DepositContribution> = g
        .contributions
        .iter()
        .zip(&g.deposited)
        .filter(|(_, done)| !**done)
        .map(|(c, _)| c.clone())
        .collect();

    let mut recovered: std::collections::BTreeMap<String, Vec<(String, Amount)>> =
        std::collections::BTreeMap::new();
    for contrib in leftovers {
        let coin = s
            .coins
            .get_mut(&contrib.coin_pub)
            .ok_or_else(|| WalletError::NotFound(format!("coin {}", contrib.coin_pub)))?;
        coin.current_amount = coin.current_amount.checked_add(&contrib.contribution)?;
        coin.status = CoinStatus::Fresh;
        recovered
            .entry(coin.exchange_base_url.clone())
            .or_default()
            .push((contrib.coin_pub, coin.current_amount.clone()));
    }
    for (exchange, inputs) in recovered {
        create_refresh_group_tx(s, &exchange, inputs, RefreshReason::AbortPay)?;
    }
    Ok(())
}

async fn submit_permission(
    wallet: &Wallet,
    group: &DepositGroupRecord,
    idx: usize,
    contrib: &DepositContribution,
) -> Result<(), WalletError> {
    let cp = contrib.coin_pub.clone();
    let coin = wallet
        .db
        .run_ro(move |s| {
            s.coins
                .get(&cp)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("coin {cp}")))
        })
        .await?;

    let payload = deposit_sig_payload(
        &group.contract_terms_hash,
        &contrib.coin_pub,
        &contrib.contribution,
    );
    let coin_sig = wallet.crypto.eddsa_sign(&coin.coin_priv, &payload).await?;
    let url = endpoint(&group.merchant_base_url, "deposit");
    let resp = wallet
        .http
        .post_json(
            &url,
            &json!({
                "coin_pub": contrib.coin_pub,
                "contribution": contrib.contribution.to_string(),
                "denom_pub_hash": coin.denom_pub_hash,
                "denom_sig": coin.denom_sig,
                "coin_sig": coin_sig,
                "h_contract_terms": group.contract_terms_hash,
                "exchange_url": coin.exchange_base_url,
            }),
        )
        .await?;
    if !resp.is_ok() {
        return Err(resp.into_server_error());
    }

    let gid = group.deposit_group_id.clone();
    wallet
        .db
        .run_rw(move |s| {
            if let Some(g) = s.deposit_groups.get_mut(&gid) {
                g.deposited[idx] = true;
            }
            Ok(())
        })
        .await?;
    debug!(coin_pub = %contrib.coin_pub, "deposit permission accepted");
    Ok(())
}
