//! Exchange keys update
//!
//! Fetches `/keys`, persists the denomination records, and reacts to
//! revocations by scheduling recoup groups for affected coins. Runs both
//! on demand (first withdrawal against an exchange) and as a scheduled
//! task with its own retry record.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::amounts::Amount;
use crate::crypto::hash_hex;
use crate::error::WalletError;
use crate::recoup;
use crate::scheduler::TaskOutcome;
use crate::store::DenominationRecord;
use crate::wallet::Wallet;

pub fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    currency: String,
    denoms: Vec<WireDenom>,
    /// Hashes of revoked denomination keys.
    #[serde(default)]
    recoup: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireDenom {
    denom_pub: String,
    value: String,
    fee_withdraw: String,
    fee_deposit: String,
    fee_refresh: String,
    fee_refund: String,
    stamp_start: DateTime<Utc>,
    stamp_expire_withdraw: DateTime<Utc>,
    stamp_expire_deposit: DateTime<Utc>,
}

fn parse_amount(s: &str, currency: &str) -> Result<Amount, WalletError> {
    let a = Amount::parse(s)
        .map_err(|_| WalletError::ProtocolViolation(format!("bad amount in keys: {s}")))?;
    if a.currency != currency {
        return Err(WalletError::ProtocolViolation(format!(
            "keys mixes currencies: {} vs {}",
            a.currency, currency
        )));
    }
    Ok(a)
}

/// Fetch and persist the exchange's current denomination keys.
pub async fn update_exchange_keys(
    wallet: &Wallet,
    exchange_base_url: &str,
) -> Result<TaskOutcome, WalletError> {
    let url = endpoint(exchange_base_url, "keys");
    let resp = wallet.http.get(&url).await?;
    if !resp.is_ok() {
        return Err(resp.into_server_error());
    }
    let keys: KeysResponse = serde_json::from_value(resp.body)
        .map_err(|e| WalletError::ProtocolViolation(format!("malformed keys response: {e}")))?;

    let mut records = Vec::with_capacity(keys.denoms.len());
    for d in &keys.denoms {
        records.push(DenominationRecord {
            exchange_base_url: exchange_base_url.to_string(),
            denom_pub_hash: hash_hex(d.denom_pub.as_bytes()),
            denom_pub: d.denom_pub.clone(),
            value: parse_amount(&d.value, &keys.currency)?,
            fee_withdraw: parse_amount(&d.fee_withdraw, &keys.currency)?,
            fee_deposit: parse_amount(&d.fee_deposit, &keys.currency)?,
            fee_refresh: parse_amount(&d.fee_refresh, &keys.currency)?,
            fee_refund: parse_amount(&d.fee_refund, &keys.currency)?,
            stamp_start: d.stamp_start,
            stamp_expire_withdraw: d.stamp_expire_withdraw,
            stamp_expire_deposit: d.stamp_expire_deposit,
            is_revoked: false,
        });
    }

    let exchange = exchange_base_url.to_string();
    let revoked = keys.recoup.clone();
    let recoup_group = wallet
        .db
        .run_rw(move |s| {
            for mut rec in records {
                // Revocation is sticky: a later keys response without the
                // hash does not un-revoke.
                let key = (exchange.clone(), rec.denom_pub_hash.clone());
                if let Some(prev) = s.denominations.get(&key) {
                    rec.is_revoked = prev.is_revoked;
                }
                s.denominations.insert(key, rec);
            }
            let mut hit_coins = Vec::new();
            for hash in &revoked {
                let key = (exchange.clone(), hash.clone());
                if let Some(d) = s.denominations.get_mut(&key) {
                    d.is_revoked = true;
                }
                for c in s.coins.values() {
                    if c.exchange_base_url == exchange
                        && &c.denom_pub_hash == hash
                        && c.is_spendable()
                    {
                        hit_coins.push(c.coin_pub.clone());
                    }
                }
            }
            if hit_coins.is_empty() {
                return Ok(None);
            }
            hit_coins.sort();
            hit_coins.dedup();
            Ok(Some(recoup::create_recoup_group_tx(
                s, &exchange, hit_coins,
            )))
        })
        .await?;

    if let Some(recoup_group_id) = recoup_group {
        warn!(
            exchange_base_url,
            recoup_group_id = %recoup_group_id,
            "revoked denominations hit live coins, recoup scheduled"
        );
        wallet.wake_task_loop();
    }
    info!(
        exchange_base_url,
        denoms = keys.denoms.len(),
        "exchange keys updated"
    );

    // With current expiry data at hand, move value off denominations that
    // are about to stop being withdrawable.
    if let Some(refresh_group_id) =
        crate::refresh::auto_refresh_check(wallet, exchange_base_url).await?
    {
        info!(exchange_base_url, refresh_group_id = %refresh_group_id, "auto refresh scheduled");
        wallet.wake_task_loop();
    }
    Ok(TaskOutcome::Finished)
}

/// Make sure denominations for the exchange are present, fetching them on
/// first contact.
pub async fn ensure_exchange_keys(
    wallet: &Wallet,
    exchange_base_url: &str,
) -> Result<(), WalletError> {
    let exchange = exchange_base_url.to_string();
    let have = wallet
        .db
        .run_ro(move |s| Ok(!s.denominations_by_exchange(&exchange).is_empty()))
        .await?;
    if !have {
        update_exchange_keys(wallet, exchange_base_url).await?;
    }
    Ok(())
}
