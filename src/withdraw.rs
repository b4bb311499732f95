//! Withdrawal engine
//!
//! Turns a funded reserve into coins. Every planchet is persisted before
//! its signature request goes out, and the planchet-to-coin transition is a
//! first-success latch inside one read-write transaction, so a crash
//! between the HTTP response and the commit can never double-mint or
//! double-spend reserve value. Coins succeed and fail individually; the
//! group is done once every planchet reached a terminal per-coin state.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::amounts::Amount;
use crate::core_types::{Timestamp, WithdrawalGroupId, now};
use crate::error::{ErrorDetail, WalletError};
use crate::exchange::{endpoint, ensure_exchange_keys};
use crate::memo::LockToken;
use crate::notify::NotificationType;
use crate::pending::{PendingOperationRecord, TaskId};
use crate::scheduler::TaskOutcome;
use crate::store::{
    CoinRecord, CoinSource, CoinStatus, DenomSelItem, DenominationRecord, GroupStatus,
    PreCoinRecord, ReserveState, WithdrawalGroupRecord,
};
use crate::wallet::Wallet;

/// Canonical byte string the reserve signs to authorize one withdrawal.
pub fn withdraw_sig_payload(blinded_envelope: &str, denom_pub_hash: &str, value: &Amount) -> Vec<u8> {
    format!("withdraw;{blinded_envelope};{denom_pub_hash};{value}").into_bytes()
}

/// Greedy denomination selection: largest value first, a denomination is
/// taken as long as `remaining >= value + fee_withdraw`. Ties break on the
/// denomination hash, so the result is deterministic for a fixed input
/// list. Residue too small for any denomination stays in the reserve.
pub fn select_withdrawal_denoms(
    denoms: &[DenominationRecord],
    amount: &Amount,
    at: Timestamp,
) -> Result<Vec<DenomSelItem>, WalletError> {
    let mut usable: Vec<&DenominationRecord> = denoms
        .iter()
        .filter(|d| d.is_withdrawable(at) && d.value.currency == amount.currency)
        .collect();
    usable.sort_by(|a, b| {
        b.value
            .cmp_value(&a.value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.denom_pub_hash.cmp(&b.denom_pub_hash))
    });

    let mut remaining = amount.clone();
    let mut selection = Vec::new();
    for d in usable {
        let cost = d.value.checked_add(&d.fee_withdraw)?;
        let mut count = 0u32;
        while remaining.cmp_value(&cost)? != std::cmp::Ordering::Less {
            remaining = remaining.checked_sub(&cost)?;
            count += 1;
        }
        if count > 0 {
            selection.push(DenomSelItem {
                denom_pub_hash: d.denom_pub_hash.clone(),
                count,
            });
        }
    }
    if selection.is_empty() {
        return Err(WalletError::InsufficientFunds {
            requested: amount.to_string(),
            available: Amount::zero(&amount.currency).to_string(),
        });
    }
    Ok(selection)
}

/// Create the withdrawal group for a funded reserve and queue it.
pub async fn create_withdrawal_group(
    wallet: &Wallet,
    reserve_pub: &str,
) -> Result<WithdrawalGroupId, WalletError> {
    let reserve_pub_owned = reserve_pub.to_string();
    let reserve = wallet
        .db
        .run_ro(move |s| {
            s.reserves
                .get(&reserve_pub_owned)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("reserve {reserve_pub_owned}")))
        })
        .await?;
    match reserve.state {
        ReserveState::Funded => {}
        ReserveState::Created => {
            return Err(WalletError::InvalidRequest(
                "reserve not confirmed funded yet".into(),
            ));
        }
        ReserveState::Dormant => {
            return Err(WalletError::InvalidRequest("reserve already drained".into()));
        }
    }

    ensure_exchange_keys(wallet, &reserve.exchange_base_url).await?;

    let withdrawal_group_id = uuid::Uuid::new_v4().to_string();
    let id_for_tx = withdrawal_group_id.clone();
    wallet
        .db
        .run_rw(move |s| {
            let denoms: Vec<DenominationRecord> = s
                .denominations_by_exchange(&reserve.exchange_base_url)
                .into_iter()
                .cloned()
                .collect();
            let selected = select_withdrawal_denoms(&denoms, &reserve.requested_amount, now())?;
            let group = WithdrawalGroupRecord {
                withdrawal_group_id: id_for_tx.clone(),
                reserve_pub: reserve.reserve_pub.clone(),
                exchange_base_url: reserve.exchange_base_url.clone(),
                raw_amount: reserve.requested_amount.clone(),
                selected_denoms: selected,
                status: GroupStatus::Created,
                last_error: None,
                timestamp_created: now(),
                timestamp_finished: None,
            };
            s.withdrawal_groups.insert(id_for_tx.clone(), group);
            let task = TaskId::Withdraw(id_for_tx.clone());
            s.pending
                .insert(task.clone(), PendingOperationRecord::new(task));
            Ok(())
        })
        .await?;
    info!(reserve_pub, withdrawal_group_id = %withdrawal_group_id, "withdrawal group created");
    Ok(withdrawal_group_id)
}

#[derive(Debug, Deserialize)]
struct WithdrawResponse {
    ev_sig: String,
}

/// One scheduler-driven attempt to advance the group. Idempotent with
/// respect to persisted sub-state.
pub async fn process_withdrawal_group(
    wallet: &Wallet,
    withdrawal_group_id: &str,
) -> Result<TaskOutcome, WalletError> {
    let id = withdrawal_group_id.to_string();
    let (group, reserve) = wallet
        .db
        .run_ro(move |s| {
            let g = s
                .withdrawal_groups
                .get(&id)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("withdrawal group {id}")))?;
            let r = s
                .reserves
                .get(&g.reserve_pub)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("reserve {}", g.reserve_pub)))?;
            Ok((g, r))
        })
        .await?;
    if group.status.is_terminal() {
        return Ok(TaskOutcome::Finished);
    }

    let _guard = wallet
        .locks
        .acquire(vec![LockToken::Reserve(group.reserve_pub.clone())])
        .await;

    if group.status == GroupStatus::Created {
        let id = group.withdrawal_group_id.clone();
        wallet
            .db
            .run_rw(move |s| {
                if let Some(g) = s.withdrawal_groups.get_mut(&id) {
                    g.status = GroupStatus::InProgress;
                }
                Ok(())
            })
            .await?;
    }

    ensure_planchets(wallet, &group).await?;
    request_signatures(wallet, &group, &reserve).await?;
    finalize_group(wallet, &group).await
}

/// Create any planchets the selection calls for that are not persisted yet.
/// Existing planchets are reused as-is, so a retry never re-randomizes.
async fn ensure_planchets(
    wallet: &Wallet,
    group: &WithdrawalGroupRecord,
) -> Result<(), WalletError> {
    let gid = group.withdrawal_group_id.clone();
    let existing_by_denom = wallet
        .db
        .run_ro(move |s| {
            let mut counts = std::collections::BTreeMap::<String, u32>::new();
            for p in s.precoins_by_group(&gid) {
                *counts.entry(p.denom_pub_hash.clone()).or_insert(0) += 1;
            }
            Ok(counts)
        })
        .await?;

    for item in &group.selected_denoms {
        let have = existing_by_denom
            .get(&item.denom_pub_hash)
            .copied()
            .unwrap_or(0);
        for _ in have..item.count {
            let kp = wallet.crypto.create_eddsa_keypair().await?;
            let blinding_factor = wallet.crypto.create_secret().await?;
            let envelope = wallet
                .crypto
                .blind_envelope(&kp.pub_hex, &blinding_factor)
                .await?;
            let exchange = group.exchange_base_url.clone();
            let denom_hash = item.denom_pub_hash.clone();
            let gid = group.withdrawal_group_id.clone();
            wallet
                .db
                .run_rw(move |s| {
                    let value = s
                        .get_denomination(&exchange, &denom_hash)
                        .map(|d| d.value.clone())
                        .ok_or_else(|| {
                            WalletError::NotFound(format!("denomination {denom_hash}"))
                        })?;
                    let precoin = PreCoinRecord {
                        coin_pub: kp.pub_hex.clone(),
                        coin_priv: kp.priv_hex.clone(),
                        exchange_base_url: exchange,
                        denom_pub_hash: denom_hash,
                        blinding_factor,
                        blinded_envelope: envelope,
                        withdrawal_group_id: gid,
                        coin_value: value,
                        withdrawal_done: false,
                        last_error: None,
                    };
                    s.precoins.insert(precoin.coin_pub.clone(), precoin);
                    Ok(())
                })
                .await?;
        }
    }
    Ok(())
}

/// Request a signature for every planchet that still needs one, verifying
/// and persisting each resulting coin independently.
async fn request_signatures(
    wallet: &Wallet,
    group: &WithdrawalGroupRecord,
    reserve: &crate::store::ReserveRecord,
) -> Result<(), WalletError> {
    let gid = group.withdrawal_group_id.clone();
    let todo: Vec<PreCoinRecord> = wallet
        .db
        .run_ro(move |s| {
            Ok(s.precoins_by_group(&gid)
                .into_iter()
                .filter(|p| !p.withdrawal_done && p.last_error.is_none())
                .cloned()
                .collect())
        })
        .await?;

    for planchet in todo {
        let denom = {
            let exchange = planchet.exchange_base_url.clone();
            let hash = planchet.denom_pub_hash.clone();
            wallet
                .db
                .run_ro(move |s| {
                    s.get_denomination(&exchange, &hash)
                        .cloned()
                        .ok_or_else(|| WalletError::NotFound(format!("denomination {hash}")))
                })
                .await?
        };

        let payload = withdraw_sig_payload(
            &planchet.blinded_envelope,
            &planchet.denom_pub_hash,
            &denom.value,
        );
        let reserve_sig = wallet
            .crypto
            .eddsa_sign(&reserve.reserve_priv, &payload)
            .await?;
        let url = endpoint(
            &group.exchange_base_url,
            &format!("reserves/{}/withdraw", reserve.reserve_pub),
        );
        let resp = wallet
            .http
            .post_json(
                &url,
                &json!({
                    "denom_pub_hash": planchet.denom_pub_hash,
                    "coin_ev": planchet.blinded_envelope,
                    "reserve_sig": reserve_sig,
                }),
            )
            .await?;
        if !resp.is_ok() {
            let err = resp.into_server_error();
            if err.is_retryable() {
                return Err(err);
            }
            // Permanent per-coin failure: record it, keep going with the
            // other planchets.
            warn!(coin_pub = %planchet.coin_pub, error = %err, "planchet failed permanently");
            let detail = ErrorDetail::from_error(&err);
            let coin_pub = planchet.coin_pub.clone();
            wallet
                .db
                .run_rw(move |s| {
                    if let Some(p) = s.precoins.get_mut(&coin_pub) {
                        p.last_error = Some(detail);
                    }
                    Ok(())
                })
                .await?;
            continue;
        }
        let parsed: WithdrawResponse = serde_json::from_value(resp.body).map_err(|e| {
            WalletError::ProtocolViolation(format!("malformed withdraw response: {e}"))
        })?;

        let sig_ok = wallet
            .crypto
            .eddsa_verify(
                &denom.denom_pub,
                planchet.blinded_envelope.as_bytes(),
                &parsed.ev_sig,
            )
            .await?;
        if !sig_ok {
            return Err(WalletError::ProtocolViolation(format!(
                "exchange signature on coin {} does not verify",
                planchet.coin_pub
            )));
        }

        let coin_pub = planchet.coin_pub.clone();
        let reserve_pub = reserve.reserve_pub.clone();
        let gid = group.withdrawal_group_id.clone();
        let ev_sig = parsed.ev_sig;
        let minted = wallet
            .db
            .run_rw(move |s| {
                let p = match s.precoins.get_mut(&coin_pub) {
                    Some(p) => p,
                    None => return Ok(false),
                };
                if p.withdrawal_done {
                    return Ok(false);
                }
                p.withdrawal_done = true;
                let coin = CoinRecord {
                    coin_pub: p.coin_pub.clone(),
                    coin_priv: p.coin_priv.clone(),
                    exchange_base_url: p.exchange_base_url.clone(),
                    denom_pub_hash: p.denom_pub_hash.clone(),
                    denom_sig: ev_sig,
                    blinding_factor: p.blinding_factor.clone(),
                    current_amount: p.coin_value.clone(),
                    source: CoinSource::Withdraw {
                        reserve_pub,
                        withdrawal_group_id: gid,
                    },
                    status: CoinStatus::Fresh,
                };
                s.coins.insert(coin.coin_pub.clone(), coin);
                Ok(true)
            })
            .await?;
        if minted {
            debug!(coin_pub = %planchet.coin_pub, "coin minted");
            wallet.notifier.notify(NotificationType::CoinWithdrawn {
                coin_pub: planchet.coin_pub.clone(),
            });
            wallet.notifier.notify(NotificationType::BalanceChange);
        }
    }
    Ok(())
}

/// Mark the group done once every planchet is terminal, retire the
/// succeeded planchets and put the reserve to rest.
async fn finalize_group(
    wallet: &Wallet,
    group: &WithdrawalGroupRecord,
) -> Result<TaskOutcome, WalletError> {
    let gid = group.withdrawal_group_id.clone();
    let reserve_pub = group.reserve_pub.clone();
    let finished = wallet
        .db
        .run_rw(move |s| {
            let all_terminal = s
                .precoins_by_group(&gid)
                .iter()
                .all(|p| p.withdrawal_done || p.last_error.is_some());
            if !all_terminal {
                return Ok(false);
            }
            let done_planchets: Vec<String> = s
                .precoins_by_group(&gid)
                .iter()
                .filter(|p| p.withdrawal_done)
                .map(|p| p.coin_pub.clone())
                .collect();
            for cp in done_planchets {
                s.precoins.remove(&cp);
            }
            if let Some(g) = s.withdrawal_groups.get_mut(&gid) {
                g.status = GroupStatus::Done;
                g.timestamp_finished = Some(now());
            }
            if let Some(r) = s.reserves.get_mut(&reserve_pub) {
                r.state = ReserveState::Dormant;
            }
            Ok(true)
        })
        .await?;
    if finished {
        info!(
            withdrawal_group_id = %group.withdrawal_group_id,
            "withdrawal group finished"
        );
        wallet
            .notifier
            .notify(NotificationType::WithdrawGroupFinished {
                withdrawal_group_id: group.withdrawal_group_id.clone(),
            });
        Ok(TaskOutcome::Finished)
    } else {
        Ok(TaskOutcome::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denom(hash: &str, value: &str, fee: &str) -> DenominationRecord {
        let t = now();
        DenominationRecord {
            exchange_base_url: "https://x/".into(),
            denom_pub_hash: hash.into(),
            denom_pub: format!("pub-{hash}"),
            value: Amount::parse(value).unwrap(),
            fee_withdraw: Amount::parse(fee).unwrap(),
            fee_deposit: Amount::zero("EUR"),
            fee_refresh: Amount::zero("EUR"),
            fee_refund: Amount::zero("EUR"),
            stamp_start: t - chrono::Duration::days(1),
            stamp_expire_withdraw: t + chrono::Duration::days(30),
            stamp_expire_deposit: t + chrono::Duration::days(60),
            is_revoked: false,
        }
    }

    #[test]
    fn test_selection_exact_cover() {
        let denoms = vec![denom("d8", "EUR:8", "EUR:0"), denom("d2", "EUR:2", "EUR:0")];
        let sel =
            select_withdrawal_denoms(&denoms, &Amount::parse("EUR:10").unwrap(), now()).unwrap();
        assert_eq!(
            sel,
            vec![
                DenomSelItem {
                    denom_pub_hash: "d8".into(),
                    count: 1
                },
                DenomSelItem {
                    denom_pub_hash: "d2".into(),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_selection_is_fee_inclusive() {
        // With a 0.5 withdraw fee a EUR:8 denom costs 8.5; EUR:10 buys one
        // of those and nothing else (2 + 0.5 > 1.5 remaining).
        let denoms = vec![
            denom("d8", "EUR:8", "EUR:0.5"),
            denom("d2", "EUR:2", "EUR:0.5"),
        ];
        let sel =
            select_withdrawal_denoms(&denoms, &Amount::parse("EUR:10").unwrap(), now()).unwrap();
        assert_eq!(sel.len(), 1);
        assert_eq!(sel[0].denom_pub_hash, "d8");
        assert_eq!(sel[0].count, 1);
    }

    #[test]
    fn test_selection_repeats_denomination() {
        let denoms = vec![denom("d2", "EUR:2", "EUR:0")];
        let sel =
            select_withdrawal_denoms(&denoms, &Amount::parse("EUR:7").unwrap(), now()).unwrap();
        assert_eq!(sel[0].count, 3);
    }

    #[test]
    fn test_selection_skips_revoked_and_expired() {
        let mut revoked = denom("d8", "EUR:8", "EUR:0");
        revoked.is_revoked = true;
        let mut expired = denom("d4", "EUR:4", "EUR:0");
        expired.stamp_expire_withdraw = now();
        let denoms = vec![revoked, expired, denom("d2", "EUR:2", "EUR:0")];
        let sel =
            select_withdrawal_denoms(&denoms, &Amount::parse("EUR:8").unwrap(), now()).unwrap();
        assert_eq!(sel.len(), 1);
        assert_eq!(sel[0].denom_pub_hash, "d2");
        assert_eq!(sel[0].count, 4);
    }

    #[test]
    fn test_selection_deterministic_tie_break() {
        // Same value, different hash: lower hash wins.
        let denoms = vec![denom("zz", "EUR:2", "EUR:0"), denom("aa", "EUR:2", "EUR:0")];
        let sel =
            select_withdrawal_denoms(&denoms, &Amount::parse("EUR:2").unwrap(), now()).unwrap();
        assert_eq!(sel[0].denom_pub_hash, "aa");
    }

    #[test]
    fn test_selection_insufficient() {
        let denoms = vec![denom("d8", "EUR:8", "EUR:0")];
        let r = select_withdrawal_denoms(&denoms, &Amount::parse("EUR:5").unwrap(), now());
        assert!(matches!(r, Err(WalletError::InsufficientFunds { .. })));
    }
}
