//! Balance aggregation
//!
//! Balances are derived, never stored: available is the sum of spendable
//! coins' remaining value, so it always matches coin-level truth. Value
//! in flight through unfinished withdrawals and refreshes shows up as
//! pending-incoming.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::amounts::Amount;
use crate::error::WalletError;
use crate::wallet::Wallet;

#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub currency: String,
    pub available: Amount,
    pub pending_incoming: Amount,
}

pub async fn get_balances(wallet: &Wallet) -> Result<Vec<Balance>, WalletError> {
    wallet
        .db
        .run_ro(|s| {
            let mut available = BTreeMap::<String, Amount>::new();
            let mut pending = BTreeMap::<String, Amount>::new();

            for c in s.coins.values() {
                if !c.is_spendable() {
                    continue;
                }
                let cur = c.current_amount.currency.clone();
                let acc = available
                    .entry(cur.clone())
                    .or_insert_with(|| Amount::zero(&cur));
                *acc = acc.checked_add(&c.current_amount)?;
            }

            for g in s.withdrawal_groups.values() {
                if g.status.is_terminal() {
                    continue;
                }
                // Once planchets exist, coins already minted from them are
                // counted in available; only the outstanding ones are still
                // incoming.
                let planchets = s.precoins_by_group(&g.withdrawal_group_id);
                let incoming = if planchets.is_empty() {
                    g.raw_amount.clone()
                } else {
                    Amount::sum(
                        &g.raw_amount.currency,
                        planchets
                            .iter()
                            .filter(|p| !p.withdrawal_done && p.last_error.is_none())
                            .map(|p| &p.coin_value),
                    )?
                };
                if incoming.is_zero() {
                    continue;
                }
                let cur = incoming.currency.clone();
                let acc = pending
                    .entry(cur.clone())
                    .or_insert_with(|| Amount::zero(&cur));
                *acc = acc.checked_add(&incoming)?;
            }
            for g in s.refresh_groups.values() {
                if g.status.is_terminal() {
                    continue;
                }
                for sess in &g.sessions {
                    if sess.finished {
                        continue;
                    }
                    let cur = sess.input_amount.currency.clone();
                    let acc = pending
                        .entry(cur.clone())
                        .or_insert_with(|| Amount::zero(&cur));
                    *acc = acc.checked_add(&sess.input_amount)?;
                }
            }

            let mut currencies: Vec<String> =
                available.keys().chain(pending.keys()).cloned().collect();
            currencies.sort();
            currencies.dedup();
            Ok(currencies
                .into_iter()
                .map(|cur| Balance {
                    available: available
                        .get(&cur)
                        .cloned()
                        .unwrap_or_else(|| Amount::zero(&cur)),
                    pending_incoming: pending
                        .get(&cur)
                        .cloned()
                        .unwrap_or_else(|| Amount::zero(&cur)),
                    currency: cur,
                })
                .collect())
        })
        .await
}
