use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use lendo_core::Address;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub wallet: WalletConfig,
    pub ledger: LedgerConfig,
    pub notifications: NotificationConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletConfig {
    /// JSON-RPC endpoint of the wallet. Without one no provider is injected.
    #[serde(default)]
    pub rpc_url: Option<String>,
    pub request_timeout_secs: u64,
    /// How often the provider is polled for account and network changes
    pub poll_interval_ms: u64,
    /// How often a pending transaction's receipt is polled
    pub confirmation_poll_ms: u64,
    /// Consecutive failed polls before the provider is reported as disconnected
    pub disconnect_after_failures: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub contract_address: Address,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    pub expiry_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Connect on startup when a provider is present
    pub auto_connect: bool,
    /// Reconnect after the full reload that follows a network change
    pub reconnect_on_network_change: bool,
}

pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder()?
            // Load from config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (LENDO__WALLET__RPC_URL, etc.)
            // Double underscore separates nested keys that contain underscores
            .add_source(
                Environment::with_prefix("LENDO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Built-in defaults only, without files or environment.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::builder()?.build()?.try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("wallet.request_timeout_secs", 30)?
            .set_default("wallet.poll_interval_ms", 1000)?
            .set_default("wallet.confirmation_poll_ms", 1000)?
            .set_default("wallet.disconnect_after_failures", 3)?
            .set_default("ledger.contract_address", DEFAULT_CONTRACT_ADDRESS)?
            .set_default("notifications.expiry_secs", 5)?
            .set_default("session.auto_connect", true)?
            .set_default("session.reconnect_on_network_change", true)
    }
}
