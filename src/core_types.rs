//! Core types used throughout the wallet
//!
//! Key material and identifiers travel as hex/uuid strings between the
//! store, the crypto facade and the wire; these aliases give them semantic
//! meaning and keep signatures readable.

/// EdDSA public key of a coin (hex). Primary key of the coins collection.
pub type CoinPub = String;

/// EdDSA private key of a coin (hex).
pub type CoinPriv = String;

/// EdDSA public key of a reserve (hex). Primary key of the reserves collection.
pub type ReservePub = String;

/// EdDSA private key of a reserve (hex).
pub type ReservePriv = String;

/// Hash of a denomination public key (hex). Together with the exchange base
/// URL this is the primary key of the denominations collection.
pub type DenomPubHash = String;

/// Identifier of a withdrawal group (uuid).
pub type WithdrawalGroupId = String;

/// Identifier of a refresh group (uuid).
pub type RefreshGroupId = String;

/// Identifier of a recoup group (uuid).
pub type RecoupGroupId = String;

/// Identifier of a deposit group (uuid).
pub type DepositGroupId = String;

/// Wall-clock timestamp for record fields and retry deadlines.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Current wall-clock time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
