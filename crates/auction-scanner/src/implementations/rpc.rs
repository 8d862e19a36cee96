//! Block source backed by an EVM JSON-RPC endpoint.

use crate::{BlockSourceInterface, ScannerError};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use auction_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};

pub struct RpcBlockSource {
	provider: DynProvider,
}

impl RpcBlockSource {
	pub fn new(rpc_url: &str) -> Result<Self, ScannerError> {
		let url = rpc_url
			.parse::<reqwest::Url>()
			.map_err(|e| ScannerError::Configuration(format!("Invalid RPC URL: {}", e)))?;
		let provider = ProviderBuilder::new().connect_http(url).erased();
		Ok(Self { provider })
	}
}

#[async_trait]
impl BlockSourceInterface for RpcBlockSource {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(RpcBlockSourceSchema)
	}

	async fn current_block(&self) -> Result<u64, ScannerError> {
		self.provider
			.get_block_number()
			.await
			.map_err(|e| ScannerError::Connection(format!("Failed to get block number: {}", e)))
	}
}

pub struct RpcBlockSourceSchema;

impl ConfigSchema for RpcBlockSourceSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("rpc_url", FieldType::String).with_validator(auction_types::http_url)],
			vec![],
		)
		.validate(config)
	}
}

/// Creates an RPC block source.
///
/// Configuration parameters:
/// - `rpc_url`: HTTP JSON-RPC endpoint (required)
pub fn create_block_source(
	config: &toml::Value,
) -> Result<Box<dyn BlockSourceInterface>, ScannerError> {
	RpcBlockSourceSchema
		.validate(config)
		.map_err(|e| ScannerError::Configuration(e.to_string()))?;

	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ScannerError::Configuration("rpc_url is required".to_string()))?;

	Ok(Box::new(RpcBlockSource::new(rpc_url)?))
}
