//! Configuration file model.
//!
//! Every pluggable component names its backend and carries an opaque
//! `config` table that is validated by the backend's own schema when the
//! engine is built.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::Table::new())
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub auction: AuctionSettings,
	pub storage: StorageConfig,
	pub timelock: TimelockConfig,
	pub blocks: BlockSourceConfig,
	pub delivery: DeliveryConfig,
	#[serde(default)]
	pub pricing: PricingConfig,
	#[serde(default)]
	pub api: Option<ApiConfig>,
	#[serde(default)]
	pub monitoring: MonitoringConfig,
}

/// Pipeline parameters shared by all stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSettings {
	/// Instance name, used in logs.
	pub id: String,
	/// Number of blocks per epoch.
	pub epoch_size: u64,
	/// Ledger chain id.
	pub chain_id: u64,
	/// Settlement contract receiving intent submissions and batch settlements.
	pub contract: String,
	/// Addresses allowed to trigger settlement.
	#[serde(default)]
	pub operators: Vec<String>,
	/// Open attempts that may find a ciphertext still sealed before it fails.
	#[serde(default = "default_max_open_attempts")]
	pub max_open_attempts: u32,
	/// Concurrent open attempts per scan.
	#[serde(default = "default_scan_concurrency")]
	pub scan_concurrency: usize,
	/// Depth after which a settlement can no longer be reverted by a reorg.
	#[serde(default = "default_finality_depth")]
	pub finality_depth: u64,
	/// Close and settle finished epochs without operator action.
	#[serde(default)]
	pub auto_settle: bool,
	/// Blocks to wait after an epoch ends before auto-settling it.
	#[serde(default = "default_settle_delay_blocks")]
	pub settle_delay_blocks: u64,
}

fn default_max_open_attempts() -> u32 {
	5
}

fn default_scan_concurrency() -> usize {
	8
}

fn default_finality_depth() -> u64 {
	12
}

fn default_settle_delay_blocks() -> u64 {
	1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelockConfig {
	pub backend: String,
	/// Upper bound for a single oracle call.
	#[serde(default = "default_timelock_timeout_ms")]
	pub timeout_ms: u64,
	/// Retries of a transient oracle outage within one call.
	#[serde(default = "default_timelock_retries")]
	pub max_retries: u32,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn default_timelock_timeout_ms() -> u64 {
	5_000
}

fn default_timelock_retries() -> u32 {
	3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSourceConfig {
	pub source: String,
	/// Polling interval of the block monitor.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn default_poll_interval_ms() -> u64 {
	1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
	/// Providers in fallback order.
	pub providers: Vec<ProviderConfig>,
	#[serde(default = "default_confirmations")]
	pub confirmations: u64,
	/// Upper bound for waiting on a confirmation.
	#[serde(default = "default_delivery_timeout")]
	pub timeout_seconds: u64,
}

fn default_confirmations() -> u64 {
	1
}

fn default_delivery_timeout() -> u64 {
	60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

/// Where the settlement price comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriceSourceSetting {
	#[default]
	Strategy,
	Oracle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
	#[serde(default = "default_strategy")]
	pub strategy: String,
	#[serde(default)]
	pub price_source: PriceSourceSetting,
	/// Reference price for markets missing from `reference_prices`.
	#[serde(default = "default_reference_price")]
	pub default_reference_price: Decimal,
	#[serde(default)]
	pub reference_prices: HashMap<String, Decimal>,
	/// Optional external quote, recorded next to the clearing price.
	#[serde(default)]
	pub oracle: Option<PriceOracleConfig>,
}

impl Default for PricingConfig {
	fn default() -> Self {
		Self {
			strategy: default_strategy(),
			price_source: PriceSourceSetting::default(),
			default_reference_price: default_reference_price(),
			reference_prices: HashMap::new(),
			oracle: None,
		}
	}
}

fn default_strategy() -> String {
	"volume_match".to_string()
}

fn default_reference_price() -> Decimal {
	Decimal::ONE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceOracleConfig {
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
	#[serde(default = "default_api_enabled")]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
}

fn default_api_enabled() -> bool {
	true
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
	#[serde(default = "default_log_level")]
	pub log_level: String,
	/// `pretty` or `json`.
	#[serde(default = "default_log_format")]
	pub log_format: String,
	/// Interval of the dispatcher balance poller, zero disables it.
	#[serde(default = "default_balance_poll")]
	pub balance_poll_seconds: u64,
}

impl Default for MonitoringConfig {
	fn default() -> Self {
		Self {
			log_level: default_log_level(),
			log_format: default_log_format(),
			balance_poll_seconds: default_balance_poll(),
		}
	}
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_log_format() -> String {
	"pretty".to_string()
}

fn default_balance_poll() -> u64 {
	30
}
