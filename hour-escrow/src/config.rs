//! Engine configuration
//!
//! Layered from built-in defaults, an optional file and `HOUR_ESCROW_*`
//! environment variables, e.g. `HOUR_ESCROW_LEDGER__RPC_URL`.

use crate::{
    error::EscrowError,
    models::{Address, BlockNumber},
    reconciler::ReconcilerConfig,
    reputation::ReputationConfig,
    retry::RetryPolicy,
    EscrowResult,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub reputation: ReputationConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            retry: RetryConfig::default(),
            reputation: ReputationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Host ledger connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Escrow contract emitting the three event streams
    #[serde(default = "Address::zero")]
    pub escrow_contract: Address,

    /// Hour token contract
    #[serde(default = "Address::zero")]
    pub token_contract: Address,

    /// Deployment block, replay starts here
    #[serde(default)]
    pub from_block: BlockNumber,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            escrow_contract: Address::zero(),
            token_contract: Address::zero(),
            from_block: 0,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LedgerConfig {
    /// Both contract addresses must be set before talking to a node
    pub fn validate(&self) -> EscrowResult<()> {
        if self.escrow_contract.is_zero() {
            return Err(EscrowError::config("ledger.escrow_contract is not configured"));
        }
        if self.token_contract.is_zero() {
            return Err(EscrowError::config("ledger.token_contract is not configured"));
        }
        if self.rpc_url.is_empty() {
            return Err(EscrowError::config("ledger.rpc_url is empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry settings for log fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> EscrowResult<RetryPolicy> {
        if self.max_attempts == 0 {
            return Err(EscrowError::config("retry.max_attempts must be at least 1"));
        }
        if !(self.multiplier >= 1.0) {
            return Err(EscrowError::config("retry.multiplier must be at least 1.0"));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        })
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay() -> u64 {
    250
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    5_000
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("HOUR_ESCROW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.retry.to_policy()?;
        Ok(config)
    }

    /// Reconciler settings for the configured escrow contract
    pub fn reconciler_config(&self) -> EscrowResult<ReconcilerConfig> {
        Ok(ReconcilerConfig {
            contract_address: self.ledger.escrow_contract.clone(),
            from_block: self.ledger.from_block,
            retry: self.retry.to_policy()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.ledger.rpc_url, "http://127.0.0.1:8545");
        assert!(config.ledger.escrow_contract.is_zero());
        assert_eq!(config.reputation.leaderboard_size, 5);
    }

    #[test]
    fn test_retry_policy_conversion() {
        let policy = RetryConfig::default().to_policy().unwrap();
        assert_eq!(policy, RetryPolicy::default());

        let zero = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(matches!(zero.to_policy(), Err(EscrowError::Config(_))));
    }

    #[test]
    fn test_unconfigured_contracts_rejected() {
        let mut ledger = LedgerConfig::default();
        assert!(ledger.validate().is_err());

        ledger.escrow_contract = Address::from_bytes([0xee; 20]);
        ledger.token_contract = Address::from_bytes([0xdd; 20]);
        assert!(ledger.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("hour-escrow-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n\n[ledger]\nescrow_contract = \"0xEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE\"\nfrom_block = 1200\n\n[retry]\nmax_attempts = 2"
        )
        .unwrap();

        let config = EngineConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.ledger.from_block, 1200);
        assert_eq!(config.ledger.escrow_contract, Address::from_bytes([0xee; 20]));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, 250);

        let reconciler = config.reconciler_config().unwrap();
        assert_eq!(reconciler.from_block, 1200);
        assert_eq!(reconciler.retry.max_attempts, 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load(Some("/nonexistent/hour-escrow")).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
    }
}
