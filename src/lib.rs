//! blindcash - Digital-cash wallet core
//!
//! Manages anonymous, blind-signed coins obtained from an exchange, built
//! around a retry-driven operation scheduler and a transactional store.
//!
//! # Modules
//!
//! - [`amounts`] - Exact fixed-point money amounts
//! - [`core_types`] - Key and identifier aliases
//! - [`error`] - Error taxonomy (retryable vs terminal)
//! - [`config`] - Yaml-backed wallet configuration
//! - [`logging`] - Tracing setup
//! - [`store`] - Records, collections and snapshot transactions
//! - [`crypto`] - Crypto facade (keys, blind envelopes, EdDSA)
//! - [`http`] - HTTP facade (the only network seam)
//! - [`memo`] - Operation memoization and the lock table
//! - [`pending`] - Task ids and retry backoff records
//! - [`scheduler`] - The task loop
//! - [`exchange`] - Exchange keys update and revocation handling
//! - [`withdraw`] - Withdrawal engine (reserve to coins)
//! - [`refresh`] - Refresh engine (melt/reveal, change and unlinkability)
//! - [`recoup`] - Recoup engine (revoked denominations)
//! - [`deposit`] - Deposit/pay engine
//! - [`balance`] - Derived balances
//! - [`notify`] - Change notifications
//! - [`wallet`] - The wallet context and command API

// Foundations - must be first!
pub mod amounts;
pub mod core_types;
pub mod error;

pub mod config;
pub mod logging;

// Data and facades
pub mod crypto;
pub mod http;
pub mod memo;
pub mod notify;
pub mod pending;
pub mod store;

// Operation engines and the loop that drives them
pub mod balance;
pub mod deposit;
pub mod exchange;
pub mod recoup;
pub mod refresh;
pub mod scheduler;
pub mod wallet;
pub mod withdraw;

// Convenient re-exports at crate root
pub use amounts::{Amount, AmountError, FRACTIONAL_BASE};
pub use balance::Balance;
pub use config::{NetworkConfig, RetryConfig, WalletConfig};
pub use crypto::{CryptoFacade, WalletCrypto};
pub use error::{ErrorDetail, WalletError};
pub use http::{HttpFacade, HttpResponse, ReqwestHttp};
pub use notify::NotificationType;
pub use pending::{PendingOperationRecord, RetryInfo, TaskId};
pub use scheduler::{RunConfig, TaskOutcome};
pub use store::{
    CoinRecord, CoinSource, CoinStatus, DenominationRecord, GroupStatus, ReserveRecord,
    ReserveState, WalletDb,
};
pub use wallet::{PayRequest, Wallet};
