//! In-process mock exchange and merchant behind the HTTP facade.
//!
//! The mock verifies every signature the way a real counterparty would and
//! panics on a duplicate state-changing request, so idempotence violations
//! fail the test at the network boundary instead of slipping through.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use blindcash::amounts::Amount;
use blindcash::crypto::hash_hex;
use blindcash::deposit::deposit_sig_payload;
use blindcash::error::WalletError;
use blindcash::http::{HttpFacade, HttpResponse};
use blindcash::recoup::recoup_sig_payload;
use blindcash::refresh::{melt_sig_payload, refresh_session_hash};
use blindcash::withdraw::withdraw_sig_payload;

pub struct MockDenom {
    pub seed: [u8; 32],
    pub denom_pub: String,
    pub denom_pub_hash: String,
    pub value: Amount,
    pub fee_withdraw: Amount,
    pub fee_deposit: Amount,
    pub fee_refresh: Amount,
    /// Expiry offsets from the time of each keys response.
    pub expire_withdraw: chrono::Duration,
    pub expire_deposit: chrono::Duration,
    pub revoked: bool,
}

#[derive(Default)]
struct MockState {
    denoms: Vec<MockDenom>,
    /// Remaining reserve balances.
    reserves: HashMap<String, Amount>,
    /// Envelope of every withdrawal already served.
    served_withdrawals: HashSet<String>,
    /// Session hashes melted so far.
    melted: HashSet<String>,
    revealed: HashSet<String>,
    recouped: HashSet<String>,
    deposited: HashSet<String>,
    /// Remaining injected failures.
    fail_next: u32,
    /// Permanently reject deposit permissions.
    reject_deposits: bool,
    requests: u64,
}

pub struct MockExchange {
    pub base_url: String,
    pub currency: String,
    state: Mutex<MockState>,
}

fn verify(pub_hex: &str, msg: &[u8], sig_hex: &str) -> bool {
    let Ok(pk) = hex::decode(pub_hex) else {
        return false;
    };
    let Ok(pk) = <[u8; 32]>::try_from(pk) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    let Some(sig) = hex::decode(sig_hex)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
    else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(&sig)).is_ok()
}

fn bad_request(hint: &str) -> HttpResponse {
    HttpResponse {
        status: 400,
        body: json!({"hint": hint}),
    }
}

impl MockExchange {
    pub fn new(base_url: &str, currency: &str) -> Self {
        MockExchange {
            base_url: base_url.to_string(),
            currency: currency.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn push_denom(
        &self,
        value: &str,
        fee_withdraw: &str,
        fee_deposit: &str,
        fee_refresh: &str,
        expire_withdraw: chrono::Duration,
        expire_deposit: chrono::Duration,
    ) -> String {
        let mut s = self.lock();
        let mut seed = [0u8; 32];
        seed[0] = (s.denoms.len() + 1) as u8;
        let sk = SigningKey::from_bytes(&seed);
        let denom_pub = hex::encode(sk.verifying_key().to_bytes());
        let denom_pub_hash = hash_hex(denom_pub.as_bytes());
        s.denoms.push(MockDenom {
            seed,
            denom_pub,
            denom_pub_hash: denom_pub_hash.clone(),
            value: Amount::parse(value).unwrap(),
            fee_withdraw: Amount::parse(fee_withdraw).unwrap(),
            fee_deposit: Amount::parse(fee_deposit).unwrap(),
            fee_refresh: Amount::parse(fee_refresh).unwrap(),
            expire_withdraw,
            expire_deposit,
            revoked: false,
        });
        denom_pub_hash
    }

    /// Register a denomination; returns its hash.
    pub fn add_denom(&self, value: &str, fee_withdraw: &str, fee_deposit: &str, fee_refresh: &str) -> String {
        self.push_denom(
            value,
            fee_withdraw,
            fee_deposit,
            fee_refresh,
            chrono::Duration::days(30),
            chrono::Duration::days(60),
        )
    }

    /// Register a denomination with custom expiry offsets, e.g. one close
    /// enough to its withdraw-expiry to trigger the proactive refresh.
    pub fn add_denom_expiring(
        &self,
        value: &str,
        fee_withdraw: &str,
        expire_withdraw: chrono::Duration,
        expire_deposit: chrono::Duration,
    ) -> String {
        let zero = format!("{}:0", self.currency);
        self.push_denom(value, fee_withdraw, &zero, &zero, expire_withdraw, expire_deposit)
    }

    pub fn fund_reserve(&self, reserve_pub: &str, amount: &str) {
        self.lock()
            .reserves
            .insert(reserve_pub.to_string(), Amount::parse(amount).unwrap());
    }

    pub fn revoke_denom(&self, denom_pub_hash: &str) {
        let mut s = self.lock();
        for d in &mut s.denoms {
            if d.denom_pub_hash == denom_pub_hash {
                d.revoked = true;
            }
        }
    }

    /// Make the next `n` requests fail with 503.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Reject all further deposit permissions with a permanent error.
    pub fn reject_deposits(&self) {
        self.lock().reject_deposits = true;
    }

    pub fn request_count(&self) -> u64 {
        self.lock().requests
    }

    fn keys_response(&self) -> HttpResponse {
        let s = self.lock();
        let t = chrono::Utc::now();
        let denoms: Vec<Value> = s
            .denoms
            .iter()
            .map(|d| {
                json!({
                    "denom_pub": d.denom_pub,
                    "value": d.value.to_string(),
                    "fee_withdraw": d.fee_withdraw.to_string(),
                    "fee_deposit": d.fee_deposit.to_string(),
                    "fee_refresh": d.fee_refresh.to_string(),
                    "fee_refund": format!("{}:0", self.currency),
                    "stamp_start": (t - chrono::Duration::days(1)).to_rfc3339(),
                    "stamp_expire_withdraw": (t + d.expire_withdraw).to_rfc3339(),
                    "stamp_expire_deposit": (t + d.expire_deposit).to_rfc3339(),
                })
            })
            .collect();
        let recoup: Vec<String> = s
            .denoms
            .iter()
            .filter(|d| d.revoked)
            .map(|d| d.denom_pub_hash.clone())
            .collect();
        HttpResponse {
            status: 200,
            body: json!({
                "currency": self.currency,
                "denoms": denoms,
                "recoup": recoup,
            }),
        }
    }

    fn handle_withdraw(&self, reserve_pub: &str, body: &Value) -> HttpResponse {
        let mut s = self.lock();
        let denom_pub_hash = body["denom_pub_hash"].as_str().unwrap_or_default();
        let coin_ev = body["coin_ev"].as_str().unwrap_or_default().to_string();
        let reserve_sig = body["reserve_sig"].as_str().unwrap_or_default();

        let Some(di) = s.denoms.iter().position(|d| d.denom_pub_hash == denom_pub_hash) else {
            return bad_request("unknown denomination");
        };
        let (value, fee, seed) = {
            let d = &s.denoms[di];
            (d.value.clone(), d.fee_withdraw.clone(), d.seed)
        };
        let payload = withdraw_sig_payload(&coin_ev, denom_pub_hash, &value);
        if !verify(reserve_pub, &payload, reserve_sig) {
            return bad_request("reserve signature invalid");
        }
        assert!(
            s.served_withdrawals.insert(coin_ev.clone()),
            "duplicate withdraw request for envelope {coin_ev}"
        );
        let Some(balance) = s.reserves.get_mut(reserve_pub) else {
            return bad_request("unknown reserve");
        };
        let cost = value.checked_add(&fee).unwrap();
        match balance.checked_sub(&cost) {
            Ok(rest) => *balance = rest,
            Err(_) => return bad_request("reserve balance insufficient"),
        }
        let ev_sig = hex::encode(
            SigningKey::from_bytes(&seed)
                .sign(coin_ev.as_bytes())
                .to_bytes(),
        );
        HttpResponse {
            status: 200,
            body: json!({"ev_sig": ev_sig}),
        }
    }

    fn handle_melt(&self, coin_pub: &str, body: &Value) -> HttpResponse {
        let mut s = self.lock();
        let rc = body["rc"].as_str().unwrap_or_default().to_string();
        let value_with_fee = body["value_with_fee"].as_str().unwrap_or_default();
        let coin_sig = body["coin_sig"].as_str().unwrap_or_default();
        let Ok(amount) = Amount::parse(value_with_fee) else {
            return bad_request("bad amount");
        };
        let payload = melt_sig_payload(&rc, &amount);
        if !verify(coin_pub, &payload, coin_sig) {
            return bad_request("melt signature invalid");
        }
        assert!(s.melted.insert(rc.clone()), "duplicate melt for {rc}");
        HttpResponse {
            status: 200,
            body: json!({"noreveal_index": 0}),
        }
    }

    fn handle_reveal(&self, rc: &str, body: &Value) -> HttpResponse {
        let mut s = self.lock();
        let old_coin_pub = body["old_coin_pub"].as_str().unwrap_or_default();
        let coin_evs: Vec<String> = body["coin_evs"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let new_denoms: Vec<String> = body["new_denoms"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default();

        if !s.melted.contains(rc) {
            return HttpResponse {
                status: 404,
                body: json!({"hint": "no such melt"}),
            };
        }
        // The reveal must match the commitment from the melt phase.
        if refresh_session_hash(old_coin_pub, &coin_evs, &new_denoms) != rc {
            return bad_request("reveal does not match commitment");
        }
        assert!(
            s.revealed.insert(rc.to_string()),
            "duplicate reveal for {rc}"
        );
        let mut ev_sigs = Vec::with_capacity(coin_evs.len());
        for (ev, dh) in coin_evs.iter().zip(&new_denoms) {
            let Some(d) = s.denoms.iter().find(|d| &d.denom_pub_hash == dh) else {
                return bad_request("unknown output denomination");
            };
            ev_sigs.push(hex::encode(
                SigningKey::from_bytes(&d.seed).sign(ev.as_bytes()).to_bytes(),
            ));
        }
        HttpResponse {
            status: 200,
            body: json!({"ev_sigs": ev_sigs}),
        }
    }

    fn handle_recoup(&self, coin_pub: &str, body: &Value) -> HttpResponse {
        let mut s = self.lock();
        let denom_pub_hash = body["denom_pub_hash"].as_str().unwrap_or_default();
        let coin_blind = body["coin_blind"].as_str().unwrap_or_default();
        let coin_sig = body["coin_sig"].as_str().unwrap_or_default();
        let Some(d) = s.denoms.iter().find(|d| d.denom_pub_hash == denom_pub_hash) else {
            return bad_request("unknown denomination");
        };
        if !d.revoked {
            return bad_request("denomination not revoked");
        }
        let payload = recoup_sig_payload(denom_pub_hash, coin_blind);
        if !verify(coin_pub, &payload, coin_sig) {
            return bad_request("recoup signature invalid");
        }
        assert!(
            s.recouped.insert(coin_pub.to_string()),
            "duplicate recoup for {coin_pub}"
        );
        HttpResponse {
            status: 200,
            body: json!({"status": "ok"}),
        }
    }

    fn handle_deposit(&self, body: &Value) -> HttpResponse {
        let mut s = self.lock();
        if s.reject_deposits {
            return bad_request("contract rejected");
        }
        let coin_pub = body["coin_pub"].as_str().unwrap_or_default();
        let contribution = body["contribution"].as_str().unwrap_or_default();
        let coin_sig = body["coin_sig"].as_str().unwrap_or_default();
        let h_contract = body["h_contract_terms"].as_str().unwrap_or_default();
        let Ok(amount) = Amount::parse(contribution) else {
            return bad_request("bad amount");
        };
        let payload = deposit_sig_payload(h_contract, coin_pub, &amount);
        if !verify(coin_pub, &payload, coin_sig) {
            return bad_request("deposit signature invalid");
        }
        let key = format!("{coin_pub}:{h_contract}");
        assert!(
            s.deposited.insert(key.clone()),
            "duplicate deposit for {key}"
        );
        HttpResponse {
            status: 200,
            body: json!({"status": "ok"}),
        }
    }

    fn route(&self, method: &str, url: &str, body: Option<&Value>) -> HttpResponse {
        {
            let mut s = self.lock();
            s.requests += 1;
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return HttpResponse {
                    status: 503,
                    body: json!({"hint": "injected failure"}),
                };
            }
        }
        let path = url
            .strip_prefix(self.base_url.trim_end_matches('/'))
            .unwrap_or(url);
        let path = path.trim_matches('/');
        let parts: Vec<&str> = path.split('/').collect();
        let empty = json!({});
        let body = body.unwrap_or(&empty);
        match (method, parts.as_slice()) {
            ("GET", ["keys"]) => self.keys_response(),
            ("POST", ["reserves", rp, "withdraw"]) => self.handle_withdraw(rp, body),
            ("POST", ["coins", cp, "melt"]) => self.handle_melt(cp, body),
            ("POST", ["refreshes", rc, "reveal"]) => self.handle_reveal(rc, body),
            ("POST", ["coins", cp, "recoup"]) => self.handle_recoup(cp, body),
            ("POST", [.., "deposit"]) => self.handle_deposit(body),
            _ => HttpResponse {
                status: 404,
                body: json!({"hint": format!("no route for {method} {path}")}),
            },
        }
    }
}

#[async_trait]
impl HttpFacade for MockExchange {
    async fn get(&self, url: &str) -> Result<HttpResponse, WalletError> {
        Ok(self.route("GET", url, None))
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, WalletError> {
        Ok(self.route("POST", url, Some(body)))
    }
}

/// Test wallet config: tiny backoff so retry tests finish quickly.
pub fn test_config() -> blindcash::WalletConfig {
    let mut c = blindcash::WalletConfig::default();
    c.retry.base_delay_ms = 5;
    c.retry.max_delay_ms = 50;
    c.retry.jitter = 0.0;
    c
}
