//! Crypto facade
//!
//! Engines talk to this trait only; the bundled implementation runs the
//! primitives on the blocking pool. Blind signing is modeled by protocol
//! role: the envelope is a salted hash of the coin public key, the
//! exchange's EdDSA signature over the envelope acts as the blind
//! signature, and local verification recomputes the envelope from the
//! coin's stored blinding factor. Key material crosses this boundary as
//! hex strings.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512_256};

use crate::error::WalletError;

#[derive(Debug, Clone)]
pub struct EddsaKeypair {
    pub priv_hex: String,
    pub pub_hex: String,
}

/// Deterministically derived coin material for one refresh output.
#[derive(Debug, Clone)]
pub struct RefreshPlanchet {
    pub coin_priv: String,
    pub coin_pub: String,
    pub blinding_factor: String,
}

#[async_trait]
pub trait CryptoFacade: Send + Sync {
    async fn create_eddsa_keypair(&self) -> Result<EddsaKeypair, WalletError>;

    /// Fresh 32-byte secret (blinding factor, transfer secret).
    async fn create_secret(&self) -> Result<String, WalletError>;

    async fn eddsa_sign(&self, priv_hex: &str, msg: &[u8]) -> Result<String, WalletError>;

    async fn eddsa_verify(
        &self,
        pub_hex: &str,
        msg: &[u8],
        sig_hex: &str,
    ) -> Result<bool, WalletError>;

    /// Blinded envelope for a coin: `H(H(coin_pub) || blinding_factor)`.
    async fn blind_envelope(
        &self,
        coin_pub_hex: &str,
        blinding_factor_hex: &str,
    ) -> Result<String, WalletError>;

    /// Derive the keypair and blinding factor for refresh output `index`
    /// from the session transfer secret. Same inputs, same planchet, so a
    /// retried session replays identical requests.
    async fn derive_refresh_planchet(
        &self,
        transfer_secret_hex: &str,
        index: u32,
    ) -> Result<RefreshPlanchet, WalletError>;
}

/// SHA-512/256 over arbitrary bytes, hex encoded. Shared by record hashing
/// (denomination hashes, contract terms) and the facade internals.
pub fn hash_hex(data: &[u8]) -> String {
    let mut h = Sha512_256::new();
    h.update(data);
    hex::encode(h.finalize())
}

fn decode32(hex_str: &str, what: &str) -> Result<[u8; 32], WalletError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| WalletError::ProtocolViolation(format!("malformed {what}: not hex")))?;
    bytes
        .try_into()
        .map_err(|_| WalletError::ProtocolViolation(format!("malformed {what}: wrong length")))
}

/// Production implementation. Every call hops to the blocking pool so a
/// burst of signature checks never stalls the scheduler.
#[derive(Debug, Default)]
pub struct WalletCrypto;

impl WalletCrypto {
    pub fn new() -> Self {
        WalletCrypto
    }

    async fn run<T: Send + 'static>(
        f: impl FnOnce() -> Result<T, WalletError> + Send + 'static,
    ) -> Result<T, WalletError> {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| WalletError::Internal(format!("crypto task panicked: {e}")))?
    }
}

#[async_trait]
impl CryptoFacade for WalletCrypto {
    async fn create_eddsa_keypair(&self) -> Result<EddsaKeypair, WalletError> {
        Self::run(|| {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            let sk = SigningKey::from_bytes(&seed);
            Ok(EddsaKeypair {
                priv_hex: hex::encode(seed),
                pub_hex: hex::encode(sk.verifying_key().to_bytes()),
            })
        })
        .await
    }

    async fn create_secret(&self) -> Result<String, WalletError> {
        Self::run(|| {
            let mut buf = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut buf);
            Ok(hex::encode(buf))
        })
        .await
    }

    async fn eddsa_sign(&self, priv_hex: &str, msg: &[u8]) -> Result<String, WalletError> {
        let priv_hex = priv_hex.to_string();
        let msg = msg.to_vec();
        Self::run(move || {
            let seed = decode32(&priv_hex, "private key")?;
            let sk = SigningKey::from_bytes(&seed);
            Ok(hex::encode(sk.sign(&msg).to_bytes()))
        })
        .await
    }

    async fn eddsa_verify(
        &self,
        pub_hex: &str,
        msg: &[u8],
        sig_hex: &str,
    ) -> Result<bool, WalletError> {
        let pub_hex = pub_hex.to_string();
        let sig_hex = sig_hex.to_string();
        let msg = msg.to_vec();
        Self::run(move || {
            let pk_bytes = decode32(&pub_hex, "public key")?;
            let vk = VerifyingKey::from_bytes(&pk_bytes)
                .map_err(|_| WalletError::ProtocolViolation("invalid public key".into()))?;
            let sig_bytes: [u8; 64] = hex::decode(&sig_hex)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| WalletError::ProtocolViolation("malformed signature".into()))?;
            let sig = Signature::from_bytes(&sig_bytes);
            Ok(vk.verify(&msg, &sig).is_ok())
        })
        .await
    }

    async fn blind_envelope(
        &self,
        coin_pub_hex: &str,
        blinding_factor_hex: &str,
    ) -> Result<String, WalletError> {
        let coin_pub_hex = coin_pub_hex.to_string();
        let blinding_factor_hex = blinding_factor_hex.to_string();
        Self::run(move || {
            let bf = decode32(&blinding_factor_hex, "blinding factor")?;
            let coin_pub_hash = hash_hex(coin_pub_hex.as_bytes());
            let mut input = Vec::with_capacity(64);
            input.extend_from_slice(coin_pub_hash.as_bytes());
            input.extend_from_slice(&bf);
            Ok(hash_hex(&input))
        })
        .await
    }

    async fn derive_refresh_planchet(
        &self,
        transfer_secret_hex: &str,
        index: u32,
    ) -> Result<RefreshPlanchet, WalletError> {
        let transfer_secret_hex = transfer_secret_hex.to_string();
        Self::run(move || {
            let ts = decode32(&transfer_secret_hex, "transfer secret")?;
            let mut seed_input = Vec::with_capacity(40);
            seed_input.extend_from_slice(&ts);
            seed_input.extend_from_slice(b"coin");
            seed_input.extend_from_slice(&index.to_le_bytes());
            let seed = decode32(&hash_hex(&seed_input), "derived seed")?;
            let sk = SigningKey::from_bytes(&seed);

            let mut bf_input = Vec::with_capacity(40);
            bf_input.extend_from_slice(&ts);
            bf_input.extend_from_slice(b"blind");
            bf_input.extend_from_slice(&index.to_le_bytes());
            let blinding_factor = hash_hex(&bf_input);

            Ok(RefreshPlanchet {
                coin_priv: hex::encode(seed),
                coin_pub: hex::encode(sk.verifying_key().to_bytes()),
                blinding_factor,
            })
        })
        .await
    }
}
