//! Refresh engine
//!
//! Converts leftover coin value into fresh, unlinkable coins. All blinding
//! material for the outputs is derived from a per-session transfer secret,
//! so a retried session replays byte-identical requests. The protocol is
//! two-phase (melt, then reveal) with the phase boundary persisted as
//! `noreveal_index`; conservation is checked exactly and a mismatch is a
//! protocol violation, never a retry.

use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::amounts::Amount;
use crate::core_types::{CoinPub, RefreshGroupId, now};
use crate::crypto::hash_hex;
use crate::error::WalletError;
use crate::exchange::endpoint;
use crate::memo::LockToken;
use crate::notify::NotificationType;
use crate::pending::{PendingOperationRecord, TaskId};
use crate::scheduler::TaskOutcome;
use crate::store::{
    CoinRecord, CoinSource, CoinStatus, GroupStatus, RefreshGroupRecord, RefreshReason,
    RefreshSession, Stores,
};
use crate::wallet::Wallet;
use crate::withdraw::select_withdrawal_denoms;

/// Commitment the melt request binds the split to: the exchange sees the
/// envelopes and output denominations only through this hash until reveal.
pub fn refresh_session_hash(
    old_coin_pub: &str,
    envelopes: &[String],
    new_denom_hashes: &[String],
) -> String {
    let mut input = String::from("rc;");
    input.push_str(old_coin_pub);
    for (ev, dh) in envelopes.iter().zip(new_denom_hashes) {
        input.push(';');
        input.push_str(ev);
        input.push(';');
        input.push_str(dh);
    }
    hash_hex(input.as_bytes())
}

/// Canonical byte string the old coin signs to authorize the melt.
pub fn melt_sig_payload(session_hash: &str, input_amount: &Amount) -> Vec<u8> {
    format!("melt;{session_hash};{input_amount}").into_bytes()
}

fn fresh_transfer_secret() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Create a refresh group inside an already-open read-write transaction,
/// deducting the input amounts from the coins in the same commit. Callers:
/// manual refresh, deposit change capture, recoup follow-up.
///
/// Inputs whose remainder cannot buy any denomination are marked finished
/// right away; the residue is forfeited and stays visible on the record.
pub fn create_refresh_group_tx(
    s: &mut Stores,
    exchange_base_url: &str,
    inputs: Vec<(CoinPub, Amount)>,
    reason: RefreshReason,
) -> Result<RefreshGroupRecord, WalletError> {
    let denoms: Vec<_> = s
        .denominations_by_exchange(exchange_base_url)
        .into_iter()
        .cloned()
        .collect();

    let mut sessions = Vec::with_capacity(inputs.len());
    for (coin_pub, input_amount) in inputs {
        let coin = s
            .coins
            .get_mut(&coin_pub)
            .ok_or_else(|| WalletError::NotFound(format!("coin {coin_pub}")))?;
        coin.current_amount = coin.current_amount.checked_sub(&input_amount)?;
        if coin.current_amount.is_zero() {
            coin.status = CoinStatus::Dormant;
        }
        let denom_pub_hash = coin.denom_pub_hash.clone();
        let old_denom = denoms
            .iter()
            .find(|d| d.denom_pub_hash == denom_pub_hash)
            .ok_or_else(|| WalletError::NotFound(format!("denomination {denom_pub_hash}")))?;

        let budget = input_amount.checked_sub(&old_denom.fee_refresh);
        let selection = match budget {
            Ok(b) if !b.is_zero() => match select_withdrawal_denoms(&denoms, &b, now()) {
                Ok(sel) => Some(sel),
                Err(WalletError::InsufficientFunds { .. }) => None,
                Err(e) => return Err(e),
            },
            _ => None,
        };

        match selection {
            Some(sel) => {
                let mut new_denoms = Vec::new();
                for item in sel {
                    for _ in 0..item.count {
                        new_denoms.push(item.denom_pub_hash.clone());
                    }
                }
                sessions.push(RefreshSession {
                    old_coin_pub: coin_pub,
                    input_amount,
                    transfer_secret: fresh_transfer_secret(),
                    new_denoms,
                    noreveal_index: None,
                    finished: false,
                });
            }
            None => {
                // Refresh unwarranted: residue too small for any output.
                warn!(coin_pub = %coin_pub, residue = %input_amount, "refresh residue forfeited");
                sessions.push(RefreshSession {
                    old_coin_pub: coin_pub,
                    input_amount,
                    transfer_secret: fresh_transfer_secret(),
                    new_denoms: Vec::new(),
                    noreveal_index: None,
                    finished: true,
                });
            }
        }
    }

    let all_finished = sessions.iter().all(|sess| sess.finished);
    let group = RefreshGroupRecord {
        refresh_group_id: uuid::Uuid::new_v4().to_string(),
        exchange_base_url: exchange_base_url.to_string(),
        reason,
        sessions,
        status: if all_finished {
            GroupStatus::Done
        } else {
            GroupStatus::Created
        },
        last_error: None,
        timestamp_created: now(),
        timestamp_finished: if all_finished { Some(now()) } else { None },
    };
    s.refresh_groups
        .insert(group.refresh_group_id.clone(), group.clone());
    if !all_finished {
        let task = TaskId::Refresh(group.refresh_group_id.clone());
        s.pending
            .insert(task.clone(), PendingOperationRecord::new(task));
    }
    Ok(group)
}

/// Refresh the full remaining value of the given coins.
pub async fn start_manual_refresh(
    wallet: &Wallet,
    exchange_base_url: &str,
    coin_pubs: &[String],
) -> Result<RefreshGroupId, WalletError> {
    let _guard = wallet
        .locks
        .acquire(vec![LockToken::ExchangeCoins(exchange_base_url.to_string())])
        .await;
    let exchange = exchange_base_url.to_string();
    let pubs = coin_pubs.to_vec();
    let group = wallet
        .db
        .run_rw(move |s| {
            let mut inputs = Vec::with_capacity(pubs.len());
            for cp in pubs {
                let coin = s
                    .coins
                    .get(&cp)
                    .ok_or_else(|| WalletError::NotFound(format!("coin {cp}")))?;
                if !coin.is_spendable() {
                    return Err(WalletError::InvalidRequest(format!(
                        "coin {cp} is not spendable"
                    )));
                }
                inputs.push((cp, coin.current_amount.clone()));
            }
            create_refresh_group_tx(s, &exchange, inputs, RefreshReason::Manual)
        })
        .await?;
    info!(refresh_group_id = %group.refresh_group_id, "manual refresh started");
    Ok(group.refresh_group_id)
}

/// Proactively refresh coins whose denomination is close to its
/// withdraw-expiry, so their value moves to a younger denomination before
/// the exchange stops accepting them.
pub async fn auto_refresh_check(
    wallet: &Wallet,
    exchange_base_url: &str,
) -> Result<Option<RefreshGroupId>, WalletError> {
    let _guard = wallet
        .locks
        .acquire(vec![LockToken::ExchangeCoins(exchange_base_url.to_string())])
        .await;
    let exchange = exchange_base_url.to_string();
    let group = wallet
        .db
        .run_rw(move |s| {
            let at = now();
            let mut inputs = Vec::new();
            for c in s.coins_by_exchange(&exchange) {
                if !c.is_spendable() {
                    continue;
                }
                let Some(d) = s.get_denomination(&exchange, &c.denom_pub_hash) else {
                    continue;
                };
                if d.is_revoked {
                    continue;
                }
                // Threshold: half the gap between withdraw- and
                // deposit-expiry before the withdraw-expiry itself.
                let gap = d.stamp_expire_deposit - d.stamp_expire_withdraw;
                let threshold = d.stamp_expire_withdraw - gap / 2;
                if at >= threshold {
                    inputs.push((c.coin_pub.clone(), c.current_amount.clone()));
                }
            }
            if inputs.is_empty() {
                return Ok(None);
            }
            inputs.sort_by(|a, b| a.0.cmp(&b.0));
            let g = create_refresh_group_tx(s, &exchange, inputs, RefreshReason::AutoExpiry)?;
            Ok(Some(g.refresh_group_id))
        })
        .await?;
    Ok(group)
}

#[derive(Debug, Deserialize)]
struct MeltResponse {
    noreveal_index: u32,
}

#[derive(Debug, Deserialize)]
struct RevealResponse {
    ev_sigs: Vec<String>,
}

struct DerivedOutputs {
    envelopes: Vec<String>,
    session_hash: String,
}

async fn derive_outputs(
    wallet: &Wallet,
    session: &RefreshSession,
) -> Result<DerivedOutputs, WalletError> {
    let mut envelopes = Vec::with_capacity(session.new_denoms.len());
    for i in 0..session.new_denoms.len() {
        let p = wallet
            .crypto
            .derive_refresh_planchet(&session.transfer_secret, i as u32)
            .await?;
        let ev = wallet
            .crypto
            .blind_envelope(&p.coin_pub, &p.blinding_factor)
            .await?;
        envelopes.push(ev);
    }
    let session_hash =
        refresh_session_hash(&session.old_coin_pub, &envelopes, &session.new_denoms);
    Ok(DerivedOutputs {
        envelopes,
        session_hash,
    })
}

/// One scheduler-driven attempt to advance the group; re-entrant, resumes
/// each session at its persisted phase.
pub async fn process_refresh_group(
    wallet: &Wallet,
    refresh_group_id: &str,
) -> Result<TaskOutcome, WalletError> {
    let id = refresh_group_id.to_string();
    let group = wallet
        .db
        .run_ro(move |s| {
            s.refresh_groups
                .get(&id)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("refresh group {id}")))
        })
        .await?;
    if group.status.is_terminal() {
        return Ok(TaskOutcome::Finished);
    }

    let _guard = wallet
        .locks
        .acquire(vec![LockToken::ExchangeCoins(
            group.exchange_base_url.clone(),
        )])
        .await;

    for (idx, session) in group.sessions.iter().enumerate() {
        if session.finished {
            continue;
        }
        process_session(wallet, &group, idx, session).await?;
    }

    let gid = group.refresh_group_id.clone();
    let done = wallet
        .db
        .run_rw(move |s| {
            let Some(g) = s.refresh_groups.get_mut(&gid) else {
                return Ok(false);
            };
            if g.sessions.iter().all(|sess| sess.finished) {
                g.status = GroupStatus::Done;
                g.timestamp_finished = Some(now());
                return Ok(true);
            }
            Ok(false)
        })
        .await?;
    if done {
        info!(refresh_group_id = %group.refresh_group_id, "refresh group finished");
        Ok(TaskOutcome::Finished)
    } else {
        Ok(TaskOutcome::Pending)
    }
}

async fn process_session(
    wallet: &Wallet,
    group: &RefreshGroupRecord,
    session_index: usize,
    session: &RefreshSession,
) -> Result<(), WalletError> {
    let outputs = derive_outputs(wallet, session).await?;

    let noreveal_index = match session.noreveal_index {
        Some(n) => n,
        None => {
            let n = melt(wallet, group, session, &outputs.session_hash).await?;
            let gid = group.refresh_group_id.clone();
            wallet
                .db
                .run_rw(move |s| {
                    if let Some(g) = s.refresh_groups.get_mut(&gid) {
                        if g.status == GroupStatus::Created {
                            g.status = GroupStatus::InProgress;
                        }
                        if let Some(sess) = g.sessions.get_mut(session_index) {
                            sess.noreveal_index = Some(n);
                        }
                    }
                    Ok(())
                })
                .await?;
            wallet.notifier.notify(NotificationType::RefreshMelted {
                refresh_group_id: group.refresh_group_id.clone(),
            });
            n
        }
    };
    debug!(
        refresh_group_id = %group.refresh_group_id,
        session_index, noreveal_index, "melt phase complete"
    );

    reveal(wallet, group, session_index, session, &outputs).await
}

async fn melt(
    wallet: &Wallet,
    group: &RefreshGroupRecord,
    session: &RefreshSession,
    session_hash: &str,
) -> Result<u32, WalletError> {
    let old_coin_pub = session.old_coin_pub.clone();
    let coin = wallet
        .db
        .run_ro(move |s| {
            s.coins
                .get(&old_coin_pub)
                .cloned()
                .ok_or_else(|| WalletError::NotFound(format!("coin {old_coin_pub}")))
        })
        .await?;
    let payload = melt_sig_payload(session_hash, &session.input_amount);
    let coin_sig = wallet.crypto.eddsa_sign(&coin.coin_priv, &payload).await?;
    let url = endpoint(
        &group.exchange_base_url,
        &format!("coins/{}/melt", session.old_coin_pub),
    );
    let resp = wallet
        .http
        .post_json(
            &url,
            &json!({
                "rc": session_hash,
                "value_with_fee": session.input_amount.to_string(),
                "coin_sig": coin_sig,
            }),
        )
        .await?;
    if !resp.is_ok() {
        return Err(resp.into_server_error());
    }
    let parsed: MeltResponse = serde_json::from_value(resp.body)
        .map_err(|e| WalletError::ProtocolViolation(format!("malformed melt response: {e}")))?;
    Ok(parsed.noreveal_index)
}

async fn reveal(
    wallet: &Wallet,
    group: &RefreshGroupRecord,
    session_index: usize,
    session: &RefreshSession,
    outputs: &DerivedOutputs,
) -> Result<(), WalletError> {
    let url = endpoint(
        &group.exchange_base_url,
        &format!("refreshes/{}/reveal", outputs.session_hash),
    );
    let resp = wallet
        .http
        .post_json(
            &url,
            &json!({
                "old_coin_pub": session.old_coin_pub,
                "coin_evs": outputs.envelopes,
                "new_denoms": session.new_denoms,
            }),
        )
        .await?;
    if !resp.is_ok() {
        return Err(resp.into_server_error());
    }
    let parsed: RevealResponse = serde_json::from_value(resp.body)
        .map_err(|e| WalletError::ProtocolViolation(format!("malformed reveal response: {e}")))?;
    if parsed.ev_sigs.len() != session.new_denoms.len() {
        return Err(WalletError::ProtocolViolation(format!(
            "reveal returned {} signatures for {} outputs",
            parsed.ev_sigs.len(),
            session.new_denoms.len()
        )));
    }

    // Verify every signature and re-check conservation before anything is
    // persisted.
    let (denoms, old_denom_fee) = {
        let exchange = group.exchange_base_url.clone();
        let hashes = session.new_denoms.clone();
        let old_coin_pub = session.old_coin_pub.clone();
        wallet
            .db
            .run_ro(move |s| {
                let mut out = Vec::with_capacity(hashes.len());
                for h in &hashes {
                    let d = s
                        .get_denomination(&exchange, h)
                        .cloned()
                        .ok_or_else(|| WalletError::NotFound(format!("denomination {h}")))?;
                    out.push(d);
                }
                let old_coin = s
                    .coins
                    .get(&old_coin_pub)
                    .ok_or_else(|| WalletError::NotFound(format!("coin {old_coin_pub}")))?;
                let fee = s
                    .get_denomination(&exchange, &old_coin.denom_pub_hash)
                    .map(|d| d.fee_refresh.clone())
                    .ok_or_else(|| {
                        WalletError::NotFound(format!(
                            "denomination {}",
                            old_coin.denom_pub_hash
                        ))
                    })?;
                Ok((out, fee))
            })
            .await?
    };

    let mut output_sum = Amount::zero(&session.input_amount.currency);
    for d in &denoms {
        output_sum = output_sum.checked_add(&d.value)?;
    }
    let consumed = output_sum.checked_add(&old_denom_fee)?;
    if consumed.cmp_value(&session.input_amount)? == std::cmp::Ordering::Greater {
        return Err(WalletError::ProtocolViolation(format!(
            "refresh would create value: outputs {output_sum} + fee {old_denom_fee} > input {}",
            session.input_amount
        )));
    }

    let mut new_coins = Vec::with_capacity(denoms.len());
    for (i, (denom, ev_sig)) in denoms.iter().zip(&parsed.ev_sigs).enumerate() {
        let planchet = wallet
            .crypto
            .derive_refresh_planchet(&session.transfer_secret, i as u32)
            .await?;
        let ok = wallet
            .crypto
            .eddsa_verify(&denom.denom_pub, outputs.envelopes[i].as_bytes(), ev_sig)
            .await?;
        if !ok {
            return Err(WalletError::ProtocolViolation(format!(
                "exchange signature on refresh output {i} does not verify"
            )));
        }
        new_coins.push(CoinRecord {
            coin_pub: planchet.coin_pub,
            coin_priv: planchet.coin_priv,
            exchange_base_url: group.exchange_base_url.clone(),
            denom_pub_hash: denom.denom_pub_hash.clone(),
            denom_sig: ev_sig.clone(),
            blinding_factor: planchet.blinding_factor,
            current_amount: denom.value.clone(),
            source: CoinSource::Refresh {
                refresh_group_id: group.refresh_group_id.clone(),
                old_coin_pub: session.old_coin_pub.clone(),
            },
            status: CoinStatus::Fresh,
        });
    }

    let gid = group.refresh_group_id.clone();
    let committed = wallet
        .db
        .run_rw(move |s| {
            let g = s
                .refresh_groups
                .get_mut(&gid)
                .ok_or_else(|| WalletError::NotFound(format!("refresh group {gid}")))?;
            let sess = g
                .sessions
                .get_mut(session_index)
                .ok_or_else(|| WalletError::Internal("session index out of range".into()))?;
            if sess.finished {
                return Ok(false);
            }
            sess.finished = true;
            for c in new_coins {
                s.coins.insert(c.coin_pub.clone(), c);
            }
            Ok(true)
        })
        .await?;
    if committed {
        wallet.notifier.notify(NotificationType::RefreshRevealed {
            refresh_group_id: group.refresh_group_id.clone(),
        });
        wallet.notifier.notify(NotificationType::BalanceChange);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DenominationRecord;

    fn denom(hash: &str, value: &str) -> DenominationRecord {
        let t = now();
        DenominationRecord {
            exchange_base_url: "https://x/".into(),
            denom_pub_hash: hash.into(),
            denom_pub: format!("pub-{hash}"),
            value: Amount::parse(value).unwrap(),
            fee_withdraw: Amount::zero("EUR"),
            fee_deposit: Amount::zero("EUR"),
            fee_refresh: Amount::parse("EUR:0.1").unwrap(),
            fee_refund: Amount::zero("EUR"),
            stamp_start: t - chrono::Duration::days(1),
            stamp_expire_withdraw: t + chrono::Duration::days(30),
            stamp_expire_deposit: t + chrono::Duration::days(60),
            is_revoked: false,
        }
    }

    fn coin(pub_hex: &str, denom_hash: &str, amount: &str) -> CoinRecord {
        CoinRecord {
            coin_pub: pub_hex.into(),
            coin_priv: "priv".into(),
            exchange_base_url: "https://x/".into(),
            denom_pub_hash: denom_hash.into(),
            denom_sig: "sig".into(),
            blinding_factor: "bf".into(),
            current_amount: Amount::parse(amount).unwrap(),
            source: CoinSource::Withdraw {
                reserve_pub: "rp".into(),
                withdrawal_group_id: "wg".into(),
            },
            status: CoinStatus::Fresh,
        }
    }

    fn stores_with(denom_list: Vec<DenominationRecord>, coins: Vec<CoinRecord>) -> Stores {
        let mut s = Stores::default();
        for d in denom_list {
            s.denominations
                .insert((d.exchange_base_url.clone(), d.denom_pub_hash.clone()), d);
        }
        for c in coins {
            s.coins.insert(c.coin_pub.clone(), c);
        }
        s
    }

    #[test]
    fn test_group_creation_deducts_input_and_selects_outputs() {
        let mut s = stores_with(
            vec![denom("d4", "EUR:4"), denom("d1", "EUR:1")],
            vec![coin("c1", "d4", "EUR:5")],
        );
        let g = create_refresh_group_tx(
            &mut s,
            "https://x/",
            vec![("c1".into(), Amount::parse("EUR:5").unwrap())],
            RefreshReason::Manual,
        )
        .unwrap();
        // Input fully consumed.
        let c = &s.coins["c1"];
        assert!(c.current_amount.is_zero());
        assert_eq!(c.status, CoinStatus::Dormant);
        // 5 minus the 0.1 melt fee buys one EUR:4; the 0.9 left cannot buy
        // a full EUR:1, so outputs are [d4].
        assert_eq!(g.sessions.len(), 1);
        assert_eq!(g.sessions[0].new_denoms, vec!["d4".to_string()]);
        assert!(!g.sessions[0].finished);
        assert!(s.pending.contains_key(&TaskId::Refresh(g.refresh_group_id)));
    }

    #[test]
    fn test_unwarranted_residue_is_forfeited() {
        let mut s = stores_with(
            vec![denom("d4", "EUR:4"), denom("d1", "EUR:1")],
            vec![coin("c1", "d4", "EUR:0.5")],
        );
        let g = create_refresh_group_tx(
            &mut s,
            "https://x/",
            vec![("c1".into(), Amount::parse("EUR:0.5").unwrap())],
            RefreshReason::PayChange,
        )
        .unwrap();
        assert!(g.sessions[0].finished);
        assert!(g.sessions[0].new_denoms.is_empty());
        assert_eq!(g.status, GroupStatus::Done);
        // No pending work was queued.
        assert!(s.pending.is_empty());
    }

    #[test]
    fn test_session_hash_commits_to_all_outputs() {
        let evs = vec!["e1".to_string(), "e2".to_string()];
        let dhs = vec!["d1".to_string(), "d2".to_string()];
        let h = refresh_session_hash("old", &evs, &dhs);
        assert_eq!(h, refresh_session_hash("old", &evs, &dhs));
        let evs2 = vec!["e1".to_string(), "eX".to_string()];
        assert_ne!(h, refresh_session_hash("old", &evs2, &dhs));
        assert_ne!(h, refresh_session_hash("other", &evs, &dhs));
    }

    #[test]
    fn test_partial_input_leaves_coin_fresh() {
        let mut s = stores_with(
            vec![denom("d1", "EUR:1")],
            vec![coin("c1", "d1", "EUR:4")],
        );
        create_refresh_group_tx(
            &mut s,
            "https://x/",
            vec![("c1".into(), Amount::parse("EUR:3").unwrap())],
            RefreshReason::Manual,
        )
        .unwrap();
        let c = &s.coins["c1"];
        assert_eq!(c.current_amount, Amount::parse("EUR:1").unwrap());
        assert_eq!(c.status, CoinStatus::Fresh);
    }
}
