//! Ledger transaction delivery.
//!
//! Submits intent and settlement transactions through an ordered list of
//! providers. A provider that fails (after retrying transient errors) hands
//! over to the next one. Confirmation waits are bounded by a timeout.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use auction_types::{ConfigSchema, RetryPolicy, Transaction, TransactionHash, TransactionReceipt};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

pub mod calldata;

pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
	pub mod local;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("Network error: {0}")]
	Network(String),
	#[error("Transaction rejected: {0}")]
	Rejected(String),
	#[error("Timed out waiting for confirmation of {0}")]
	Timeout(String),
	#[error("No delivery provider available")]
	NoProviderAvailable,
	#[error("Encoding error: {0}")]
	Encoding(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl DeliveryError {
	pub fn is_transient(&self) -> bool {
		matches!(self, DeliveryError::Network(_))
	}
}

/// A connection to the ledger able to sign and submit transactions.
#[async_trait]
pub trait DeliveryInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Address transactions are sent from.
	fn address(&self) -> Address;

	async fn submit(&self, tx: Transaction) -> Result<TransactionHash, DeliveryError>;

	/// Waits until the transaction is included with `confirmations` blocks,
	/// counting its own block as the first.
	async fn wait_for_confirmation(
		&self,
		hash: &TransactionHash,
		confirmations: u64,
	) -> Result<TransactionReceipt, DeliveryError>;

	/// Receipt of an included transaction, `None` while unknown to the ledger.
	async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, DeliveryError>;

	/// Native balance of the sending address.
	async fn balance(&self) -> Result<U256, DeliveryError>;
}

pub struct DeliveryService {
	providers: Vec<Box<dyn DeliveryInterface>>,
	confirmations: u64,
	timeout: Duration,
	retry: RetryPolicy,
}

impl DeliveryService {
	pub fn new(
		providers: Vec<Box<dyn DeliveryInterface>>,
		confirmations: u64,
		timeout: Duration,
	) -> Self {
		Self {
			providers,
			confirmations: confirmations.max(1),
			timeout,
			retry: RetryPolicy::default(),
		}
	}

	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn confirmations(&self) -> u64 {
		self.confirmations
	}

	fn primary(&self) -> Result<&dyn DeliveryInterface, DeliveryError> {
		self.providers
			.first()
			.map(|provider| provider.as_ref())
			.ok_or(DeliveryError::NoProviderAvailable)
	}

	/// Sending address of the primary provider.
	pub fn address(&self) -> Result<Address, DeliveryError> {
		Ok(self.primary()?.address())
	}

	/// Submits `tx` through the first provider that accepts it.
	#[instrument(skip(self, tx), fields(kind = ?tx.kind))]
	pub async fn deliver(&self, tx: Transaction) -> Result<TransactionHash, DeliveryError> {
		let mut last_error = None;
		for (index, provider) in self.providers.iter().enumerate() {
			let result = self
				.retry
				.retry("delivery.submit", DeliveryError::is_transient, || {
					provider.submit(tx.clone())
				})
				.await;
			match result {
				Ok(hash) => {
					info!(tx_hash = %hash.short(), provider = index, "transaction submitted");
					return Ok(hash);
				}
				Err(e) => {
					warn!(provider = index, error = %e, "provider failed to submit");
					last_error = Some(e);
				}
			}
		}
		Err(last_error.unwrap_or(DeliveryError::NoProviderAvailable))
	}

	/// Waits for the configured number of confirmations, bounded by the
	/// delivery timeout.
	pub async fn confirm(
		&self,
		hash: &TransactionHash,
	) -> Result<TransactionReceipt, DeliveryError> {
		let wait = async {
			let mut last_error = None;
			for (index, provider) in self.providers.iter().enumerate() {
				match provider.wait_for_confirmation(hash, self.confirmations).await {
					Ok(receipt) => return Ok(receipt),
					Err(e) if e.is_transient() => {
						warn!(
							provider = index,
							tx_hash = %hash.short(),
							error = %e,
							"confirmation check failed"
						);
						last_error = Some(e);
					}
					Err(e) => return Err(e),
				}
			}
			Err(last_error.unwrap_or(DeliveryError::NoProviderAvailable))
		};

		tokio::time::timeout(self.timeout, wait)
			.await
			.map_err(|_| DeliveryError::Timeout(hash.short()))?
	}

	pub async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, DeliveryError> {
		let mut answered = false;
		let mut last_error = None;
		for provider in &self.providers {
			match provider.get_receipt(hash).await {
				Ok(Some(receipt)) => return Ok(Some(receipt)),
				Ok(None) => answered = true,
				Err(e) => last_error = Some(e),
			}
		}
		match (answered, last_error) {
			(true, _) => Ok(None),
			(false, Some(e)) => Err(e),
			(false, None) => Err(DeliveryError::NoProviderAvailable),
		}
	}

	pub async fn balance(&self) -> Result<U256, DeliveryError> {
		self.primary()?.balance().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::local::LocalLedger;
	use auction_types::TransactionKind;

	fn tx() -> Transaction {
		Transaction {
			to: Some(Address::repeat_byte(0x22)),
			data: vec![0xaa, 0xbb],
			value: U256::ZERO,
			chain_id: 31337,
			gas_limit: None,
			kind: TransactionKind::BatchSettlement,
		}
	}

	fn fast() -> RetryPolicy {
		RetryPolicy::default()
			.with_max_retries(1)
			.with_initial_interval(Duration::from_millis(1))
	}

	#[tokio::test]
	async fn test_transient_failures_are_retried() {
		let ledger = LocalLedger::new(10);
		ledger.handle().fail_next_submissions(1);
		let service = DeliveryService::new(vec![Box::new(ledger)], 1, Duration::from_secs(1))
			.with_retry_policy(fast());

		let hash = service.deliver(tx()).await.unwrap();
		let receipt = service.confirm(&hash).await.unwrap();
		assert!(receipt.success);
		assert_eq!(receipt.block_number, 11);
	}

	#[tokio::test]
	async fn test_falls_back_to_next_provider() {
		let broken = LocalLedger::new(10);
		broken.handle().fail_next_submissions(10);
		let healthy = LocalLedger::new(50);
		let service = DeliveryService::new(
			vec![Box::new(broken), Box::new(healthy)],
			1,
			Duration::from_secs(1),
		)
		.with_retry_policy(fast());

		let hash = service.deliver(tx()).await.unwrap();
		// The primary never saw the transaction, the fallback mined it.
		let receipt = service.get_receipt(&hash).await.unwrap().unwrap();
		assert_eq!(receipt.block_number, 51);
	}

	#[tokio::test]
	async fn test_confirmation_wait_is_bounded() {
		let ledger = LocalLedger::new(10);
		let service = DeliveryService::new(vec![Box::new(ledger)], 3, Duration::from_millis(50));

		let hash = service.deliver(tx()).await.unwrap();
		assert!(matches!(
			service.confirm(&hash).await,
			Err(DeliveryError::Timeout(_))
		));
	}

	#[tokio::test]
	async fn test_no_providers() {
		let service = DeliveryService::new(vec![], 1, Duration::from_secs(1));
		assert!(matches!(
			service.deliver(tx()).await,
			Err(DeliveryError::NoProviderAvailable)
		));
		assert!(service.address().is_err());
	}
}
