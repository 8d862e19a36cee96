//! Alloy-based EVM delivery.
//!
//! Signs with a local private key and submits over HTTP JSON-RPC. Nonce,
//! gas and fee fields are filled by the provider.

use crate::{DeliveryError, DeliveryInterface};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;
use auction_types::{
	ConfigSchema, Field, FieldType, Schema, Transaction, TransactionHash, TransactionReceipt,
	ValidationError,
};
use std::time::Duration;
use tracing::{debug, info};

pub struct AlloyDelivery {
	provider: DynProvider,
	address: Address,
	poll_interval: Duration,
}

impl AlloyDelivery {
	pub fn new(
		rpc_url: &str,
		chain_id: u64,
		signer: PrivateKeySigner,
		poll_interval: Duration,
	) -> Result<Self, DeliveryError> {
		let url = rpc_url
			.parse()
			.map_err(|e| DeliveryError::Configuration(format!("Invalid RPC URL: {}", e)))?;

		let signer = signer.with_chain_id(Some(chain_id));
		let address = signer.address();
		let provider = ProviderBuilder::new()
			.wallet(EthereumWallet::from(signer))
			.connect_http(url)
			.erased();

		Ok(Self {
			provider,
			address,
			poll_interval,
		})
	}

	fn tx_hash(hash: &TransactionHash) -> Result<B256, DeliveryError> {
		B256::try_from(hash.0.as_slice())
			.map_err(|_| DeliveryError::Encoding(format!("not a 32-byte hash: {}", hash)))
	}

	async fn fetch_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, DeliveryError> {
		let receipt = self
			.provider
			.get_transaction_receipt(Self::tx_hash(hash)?)
			.await
			.map_err(|e| DeliveryError::Network(format!("Failed to get receipt: {}", e)))?;

		Ok(receipt.map(|receipt| TransactionReceipt {
			hash: TransactionHash(receipt.transaction_hash.0.to_vec()),
			block_number: receipt.block_number.unwrap_or(0),
			success: receipt.status(),
		}))
	}
}

#[async_trait]
impl DeliveryInterface for AlloyDelivery {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyDeliverySchema)
	}

	fn address(&self) -> Address {
		self.address
	}

	async fn submit(&self, tx: Transaction) -> Result<TransactionHash, DeliveryError> {
		let request: TransactionRequest = tx.into();
		let pending = self
			.provider
			.send_transaction(request)
			.await
			.map_err(|e| DeliveryError::Network(format!("Failed to send transaction: {}", e)))?;

		let hash = TransactionHash(pending.tx_hash().0.to_vec());
		info!(tx_hash = %hash.short(), "submitted transaction");
		Ok(hash)
	}

	async fn wait_for_confirmation(
		&self,
		hash: &TransactionHash,
		confirmations: u64,
	) -> Result<TransactionReceipt, DeliveryError> {
		info!(tx_hash = %hash.short(), confirmations, "waiting for confirmations");
		loop {
			if let Some(receipt) = self.fetch_receipt(hash).await? {
				let head = self.provider.get_block_number().await.map_err(|e| {
					DeliveryError::Network(format!("Failed to get block number: {}", e))
				})?;
				let depth = head.saturating_sub(receipt.block_number) + 1;
				if depth >= confirmations {
					return Ok(receipt);
				}
				debug!(
					tx_hash = %hash.short(),
					remaining = confirmations - depth,
					"waiting for more confirmations"
				);
			}
			tokio::time::sleep(self.poll_interval).await;
		}
	}

	async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, DeliveryError> {
		self.fetch_receipt(hash).await
	}

	async fn balance(&self) -> Result<U256, DeliveryError> {
		self.provider
			.get_balance(self.address)
			.await
			.map_err(|e| DeliveryError::Network(format!("Failed to get balance: {}", e)))
	}
}

fn private_key(value: &toml::Value) -> Result<(), String> {
	let key = value.as_str().ok_or("expected a string")?;
	let key_without_prefix = key.strip_prefix("0x").unwrap_or(key);
	if key_without_prefix.len() != 64 {
		return Err("Private key must be 64 hex characters (32 bytes)".to_string());
	}
	if hex::decode(key_without_prefix).is_err() {
		return Err("Private key must be valid hexadecimal".to_string());
	}
	Ok(())
}

pub struct AlloyDeliverySchema;

impl ConfigSchema for AlloyDeliverySchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![
				Field::new("rpc_url", FieldType::String).with_validator(auction_types::http_url),
				Field::new("private_key", FieldType::String).with_validator(private_key),
				Field::new(
					"chain_id",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
			],
			vec![Field::new(
				"poll_interval_ms",
				FieldType::Integer {
					min: Some(1),
					max: None,
				},
			)],
		)
		.validate(config)
	}
}

/// Creates an alloy delivery provider.
///
/// Configuration parameters:
/// - `rpc_url`: HTTP RPC endpoint (required)
/// - `chain_id`: chain id used for signing (required)
/// - `private_key`: hex private key of the sending account (required)
/// - `poll_interval_ms`: receipt polling interval (default: 2000)
pub fn create_delivery(config: &toml::Value) -> Result<Box<dyn DeliveryInterface>, DeliveryError> {
	AlloyDeliverySchema
		.validate(config)
		.map_err(|e| DeliveryError::Configuration(e.to_string()))?;

	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| DeliveryError::Configuration("rpc_url is required".to_string()))?;
	let chain_id = config
		.get("chain_id")
		.and_then(|v| v.as_integer())
		.ok_or_else(|| DeliveryError::Configuration("chain_id is required".to_string()))?
		as u64;
	let signer: PrivateKeySigner = config
		.get("private_key")
		.and_then(|v| v.as_str())
		.ok_or_else(|| DeliveryError::Configuration("private_key is required".to_string()))?
		.parse()
		.map_err(|e| DeliveryError::Configuration(format!("Invalid private key: {}", e)))?;
	let poll_interval = config
		.get("poll_interval_ms")
		.and_then(|v| v.as_integer())
		.unwrap_or(2_000) as u64;

	Ok(Box::new(AlloyDelivery::new(
		rpc_url,
		chain_id,
		signer,
		Duration::from_millis(poll_interval),
	)?))
}
