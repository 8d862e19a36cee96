//! Configuration loading for the auction service.
//!
//! Files are TOML. Before parsing, `${VAR}` and `${VAR:-default}` references
//! are replaced with environment values. After parsing, a handful of
//! `AUCTION_*` variables override individual settings and the result is
//! validated as a whole.

use auction_types::validation;
use regex::{Captures, Regex};
use rust_decimal::Decimal;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Loads a [`Config`] from a file with environment substitution and overrides.
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "AUCTION_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<Config, ConfigError> {
		let file_path = self.file_path.as_ref().ok_or_else(|| {
			ConfigError::FileNotFound("No configuration file specified".to_string())
		})?;

		if !Path::new(file_path).exists() {
			return Err(ConfigError::FileNotFound(file_path.clone()));
		}
		let content = tokio::fs::read_to_string(file_path).await?;
		self.load_from_str(&content)
	}

	/// Parses configuration text, applying the same pipeline as [`load`](Self::load).
	pub fn load_from_str(&self, content: &str) -> Result<Config, ConfigError> {
		let substituted = substitute_env_vars(content)?;
		let mut config: Config =
			toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))?;

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;
		Ok(config)
	}

	fn env(&self, name: &str) -> Option<String> {
		env::var(format!("{}{}", self.env_prefix, name)).ok()
	}

	fn apply_env_overrides(&self, config: &mut Config) -> Result<(), ConfigError> {
		if let Some(log_level) = self.env("LOG_LEVEL") {
			debug!(%log_level, "overriding log level from environment");
			config.monitoring.log_level = log_level;
		}

		if let Some(epoch_size) = self.env("EPOCH_SIZE") {
			config.auction.epoch_size = epoch_size
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid epoch size: {}", e)))?;
		}

		if let Some(host) = self.env("API_HOST") {
			config.api.get_or_insert_with(default_api).host = host;
		}

		if let Some(port) = self.env("API_PORT") {
			config.api.get_or_insert_with(default_api).port = port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid API port: {}", e)))?;
		}

		Ok(())
	}
}

fn default_api() -> ApiConfig {
	ApiConfig {
		enabled: true,
		host: "127.0.0.1".to_string(),
		port: 3000,
	}
}

/// Replaces `${VAR}` and `${VAR:-default}` with environment values.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
	let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
		.map_err(|e| ConfigError::ParseError(e.to_string()))?;

	let mut missing = None;
	let result = re.replace_all(content, |cap: &Captures| {
		let name = &cap[1];
		match (env::var(name), cap.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				missing.get_or_insert_with(|| name.to_string());
				String::new()
			}
		}
	});

	match missing {
		Some(name) => Err(ConfigError::EnvVarNotFound(name)),
		None => Ok(result.into_owned()),
	}
}

fn invalid(message: impl Into<String>) -> ConfigError {
	ConfigError::ValidationError(message.into())
}

/// Cross-field checks that serde cannot express.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
	let auction = &config.auction;

	if auction.epoch_size == 0 {
		return Err(invalid("auction.epoch_size must be at least 1"));
	}
	if auction.max_open_attempts == 0 {
		return Err(invalid("auction.max_open_attempts must be at least 1"));
	}
	if auction.scan_concurrency == 0 {
		return Err(invalid("auction.scan_concurrency must be at least 1"));
	}

	validation::hex_address(&toml::Value::String(auction.contract.clone()))
		.map_err(|e| invalid(format!("auction.contract: {}", e)))?;
	for operator in &auction.operators {
		validation::hex_address(&toml::Value::String(operator.clone()))
			.map_err(|e| invalid(format!("auction.operators '{}': {}", operator, e)))?;
	}

	if config.delivery.providers.is_empty() {
		return Err(invalid("At least one delivery provider must be configured"));
	}

	let pricing = &config.pricing;
	if pricing.default_reference_price <= Decimal::ZERO {
		return Err(invalid("pricing.default_reference_price must be positive"));
	}
	if let Some((market, _)) = pricing
		.reference_prices
		.iter()
		.find(|(_, price)| **price <= Decimal::ZERO)
	{
		return Err(invalid(format!(
			"pricing.reference_prices['{}'] must be positive",
			market
		)));
	}
	if pricing.price_source == PriceSourceSetting::Oracle && pricing.oracle.is_none() {
		return Err(invalid(
			"pricing.price_source = \"oracle\" requires a [pricing.oracle] section",
		));
	}

	if !matches!(config.monitoring.log_format.as_str(), "pretty" | "json") {
		return Err(invalid(format!(
			"monitoring.log_format must be 'pretty' or 'json', got '{}'",
			config.monitoring.log_format
		)));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

	fn minimal(extra: &str) -> String {
		format!(
			r#"
[auction]
id = "test"
epoch_size = 10
chain_id = 31337
contract = "{CONTRACT}"
operators = ["0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"]

[storage]
backend = "memory"

[timelock]
backend = "local"

[blocks]
source = "manual"

[[delivery.providers]]
backend = "local"

{extra}
"#
		)
	}

	#[test]
	fn test_defaults_fill_optional_sections() {
		let config = ConfigLoader::new().load_from_str(&minimal("")).unwrap();

		assert_eq!(config.auction.epoch_size, 10);
		assert_eq!(config.auction.max_open_attempts, 5);
		assert_eq!(config.timelock.timeout_ms, 5_000);
		assert_eq!(config.pricing.strategy, "volume_match");
		assert_eq!(config.pricing.default_reference_price, Decimal::ONE);
		assert!(config.storage.config.as_table().unwrap().is_empty());
		assert!(config.api.is_none());
	}

	#[test]
	fn test_reference_prices_parse_as_decimals() {
		let config = ConfigLoader::new()
			.load_from_str(&minimal(
				"[pricing.reference_prices]\n\"ETH/USDC\" = \"2000.5\"\n",
			))
			.unwrap();
		assert_eq!(
			config.pricing.reference_prices["ETH/USDC"].to_string(),
			"2000.5"
		);
	}

	#[test]
	fn test_env_substitution_with_default() {
		env::set_var("AUCTION_CONFIG_TEST_ID", "from-env");
		let text = minimal("")
			.replace("id = \"test\"", "id = \"${AUCTION_CONFIG_TEST_ID}\"")
			.replace(
				"chain_id = 31337",
				"chain_id = ${AUCTION_CONFIG_TEST_UNSET_CHAIN:-1337}",
			);

		let config = ConfigLoader::new().load_from_str(&text).unwrap();
		assert_eq!(config.auction.id, "from-env");
		assert_eq!(config.auction.chain_id, 1337);
	}

	#[test]
	fn test_missing_env_var_is_reported() {
		let text = minimal("").replace("id = \"test\"", "id = \"${AUCTION_CONFIG_TEST_MISSING}\"");
		assert!(matches!(
			ConfigLoader::new().load_from_str(&text),
			Err(ConfigError::EnvVarNotFound(name)) if name == "AUCTION_CONFIG_TEST_MISSING"
		));
	}

	#[test]
	fn test_oracle_price_source_requires_oracle() {
		let err = ConfigLoader::new()
			.load_from_str(&minimal("[pricing]\nprice_source = \"oracle\"\n"))
			.unwrap_err();
		assert!(matches!(err, ConfigError::ValidationError(_)));
	}

	#[test]
	fn test_invalid_operator_rejected() {
		let text = minimal("").replace(
			"0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
			"0x1234",
		);
		assert!(matches!(
			ConfigLoader::new().load_from_str(&text),
			Err(ConfigError::ValidationError(_))
		));
	}

	#[test]
	fn test_prefixed_overrides() {
		env::set_var("AUCTION_CFGTEST_API_PORT", "4100");
		let config = ConfigLoader::new()
			.with_env_prefix("AUCTION_CFGTEST_")
			.load_from_str(&minimal(""))
			.unwrap();
		assert_eq!(config.api.map(|api| api.port), Some(4100));
	}

	#[tokio::test]
	async fn test_load_from_file() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		file.write_all(minimal("").as_bytes()).unwrap();

		let config = ConfigLoader::new()
			.with_file(file.path())
			.load()
			.await
			.unwrap();
		assert_eq!(config.auction.id, "test");

		let missing = ConfigLoader::new()
			.with_file("/nonexistent/auction.toml")
			.load()
			.await;
		assert!(matches!(missing, Err(ConfigError::FileNotFound(_))));
	}
}
