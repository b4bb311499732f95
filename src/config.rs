use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WalletConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Backoff policy for the task scheduler.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    /// Base delay in milliseconds; doubles per retry.
    pub base_delay_ms: u64,
    /// Upper bound on the computed delay.
    pub max_delay_ms: u64,
    /// Jitter fraction applied to each delay (0.25 = +/-25%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 120_000,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Per-request timeout in milliseconds. A timeout is a retryable error,
    /// never a silently abandoned operation.
    pub request_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "wallet.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl WalletConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;
        Ok(serde_yaml::from_str(&content)?)
    }
}
