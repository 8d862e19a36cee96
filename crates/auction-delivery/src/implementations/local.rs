//! In-memory ledger.
//!
//! Every accepted transaction is mined into the block after the current
//! head. A [`LocalLedgerHandle`] moves the head, injects submission failures
//! and reverts, and drops mined transactions to simulate a reorg.

use crate::{DeliveryError, DeliveryInterface};
use alloy::primitives::{keccak256, Address, U256};
use async_trait::async_trait;
use auction_types::{
	ConfigSchema, Field, FieldType, Schema, Transaction, TransactionHash, TransactionReceipt,
	ValidationError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_ADDRESS: Address = Address::repeat_byte(0x5e);

#[derive(Default)]
struct LedgerState {
	head: u64,
	nonce: u64,
	receipts: HashMap<Vec<u8>, TransactionReceipt>,
	fail_submissions: u32,
	revert_submissions: u32,
	balance: U256,
}

/// Cloneable control over a [`LocalLedger`].
#[derive(Clone)]
pub struct LocalLedgerHandle {
	state: Arc<Mutex<LedgerState>>,
}

impl LocalLedgerHandle {
	fn lock(&self) -> MutexGuard<'_, LedgerState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn head(&self) -> u64 {
		self.lock().head
	}

	pub fn set_head(&self, head: u64) {
		self.lock().head = head;
	}

	pub fn advance(&self, blocks: u64) -> u64 {
		let mut state = self.lock();
		state.head = state.head.saturating_add(blocks);
		state.head
	}

	/// The next `count` submissions fail with a network error.
	pub fn fail_next_submissions(&self, count: u32) {
		self.lock().fail_submissions = count;
	}

	/// The next `count` submissions are mined but revert.
	pub fn revert_next_submissions(&self, count: u32) {
		self.lock().revert_submissions = count;
	}

	/// Removes a mined transaction, as a reorg would.
	pub fn drop_transaction(&self, hash: &TransactionHash) -> bool {
		self.lock().receipts.remove(&hash.0).is_some()
	}

	pub fn set_balance(&self, balance: U256) {
		self.lock().balance = balance;
	}

	pub fn transaction_count(&self) -> usize {
		self.lock().receipts.len()
	}

	/// Another provider over the same ledger, sending from the default address.
	pub fn ledger(&self) -> LocalLedger {
		LocalLedger {
			address: DEFAULT_ADDRESS,
			handle: self.clone(),
		}
	}
}

pub struct LocalLedger {
	address: Address,
	handle: LocalLedgerHandle,
}

impl LocalLedger {
	pub fn new(head: u64) -> Self {
		Self {
			address: DEFAULT_ADDRESS,
			handle: LocalLedgerHandle {
				state: Arc::new(Mutex::new(LedgerState {
					head,
					..Default::default()
				})),
			},
		}
	}

	pub fn with_address(mut self, address: Address) -> Self {
		self.address = address;
		self
	}

	pub fn handle(&self) -> LocalLedgerHandle {
		self.handle.clone()
	}
}

#[async_trait]
impl DeliveryInterface for LocalLedger {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalLedgerSchema)
	}

	fn address(&self) -> Address {
		self.address
	}

	async fn submit(&self, tx: Transaction) -> Result<TransactionHash, DeliveryError> {
		let mut state = self.handle.lock();
		if state.fail_submissions > 0 {
			state.fail_submissions -= 1;
			return Err(DeliveryError::Network("local ledger unavailable".to_string()));
		}

		let success = if state.revert_submissions > 0 {
			state.revert_submissions -= 1;
			false
		} else {
			true
		};

		let mut preimage = state.nonce.to_be_bytes().to_vec();
		preimage.extend_from_slice(self.address.as_slice());
		preimage.extend_from_slice(&tx.data);
		let hash = TransactionHash(keccak256(&preimage).to_vec());

		state.nonce += 1;
		state.head += 1;
		let receipt = TransactionReceipt {
			hash: hash.clone(),
			block_number: state.head,
			success,
		};
		debug!(tx_hash = %hash.short(), block = state.head, success, kind = ?tx.kind, "mined");
		state.receipts.insert(hash.0.clone(), receipt);
		Ok(hash)
	}

	async fn wait_for_confirmation(
		&self,
		hash: &TransactionHash,
		confirmations: u64,
	) -> Result<TransactionReceipt, DeliveryError> {
		loop {
			{
				let state = self.handle.lock();
				if let Some(receipt) = state.receipts.get(&hash.0) {
					let depth = state.head.saturating_sub(receipt.block_number) + 1;
					if depth >= confirmations {
						return Ok(receipt.clone());
					}
				}
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, DeliveryError> {
		Ok(self.handle.lock().receipts.get(&hash.0).cloned())
	}

	async fn balance(&self) -> Result<U256, DeliveryError> {
		Ok(self.handle.lock().balance)
	}
}

pub struct LocalLedgerSchema;

impl ConfigSchema for LocalLedgerSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![],
			vec![
				Field::new(
					"start_block",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
				Field::new("address", FieldType::String).with_validator(auction_types::hex_address),
				Field::new("balance_wei", FieldType::String),
			],
		)
		.validate(config)
	}
}

/// Creates an in-memory ledger.
///
/// Configuration parameters:
/// - `start_block`: initial head (default: 0)
/// - `address`: sending address reported to callers
/// - `balance_wei`: reported balance as a decimal string (default: 0)
pub fn create_delivery(config: &toml::Value) -> Result<Box<dyn DeliveryInterface>, DeliveryError> {
	LocalLedgerSchema
		.validate(config)
		.map_err(|e| DeliveryError::Configuration(e.to_string()))?;

	let start_block = config
		.get("start_block")
		.and_then(|v| v.as_integer())
		.unwrap_or(0) as u64;
	let mut ledger = LocalLedger::new(start_block);

	if let Some(address) = config.get("address").and_then(|v| v.as_str()) {
		let address = address
			.parse::<Address>()
			.map_err(|e| DeliveryError::Configuration(format!("Invalid address: {}", e)))?;
		ledger = ledger.with_address(address);
	}
	if let Some(balance) = config.get("balance_wei").and_then(|v| v.as_str()) {
		let balance = balance
			.parse::<U256>()
			.map_err(|e| DeliveryError::Configuration(format!("Invalid balance: {}", e)))?;
		ledger.handle().set_balance(balance);
	}

	Ok(Box::new(ledger))
}

#[cfg(test)]
mod tests {
	use super::*;
	use auction_types::TransactionKind;

	fn tx(data: u8) -> Transaction {
		Transaction {
			to: None,
			data: vec![data],
			value: U256::ZERO,
			chain_id: 1,
			gas_limit: None,
			kind: TransactionKind::IntentSubmission,
		}
	}

	#[tokio::test]
	async fn test_mines_one_block_per_transaction() {
		let ledger = LocalLedger::new(100);
		let first = ledger.submit(tx(1)).await.unwrap();
		let second = ledger.submit(tx(1)).await.unwrap();
		assert_ne!(first, second);

		assert_eq!(ledger.get_receipt(&first).await.unwrap().unwrap().block_number, 101);
		assert_eq!(ledger.get_receipt(&second).await.unwrap().unwrap().block_number, 102);
		assert_eq!(ledger.handle().head(), 102);
	}

	#[tokio::test]
	async fn test_reverts_and_drops() {
		let ledger = LocalLedger::new(0);
		let handle = ledger.handle();
		handle.revert_next_submissions(1);

		let reverted = ledger.submit(tx(1)).await.unwrap();
		assert!(!ledger.get_receipt(&reverted).await.unwrap().unwrap().success);

		let mined = ledger.submit(tx(2)).await.unwrap();
		assert!(handle.drop_transaction(&mined));
		assert!(ledger.get_receipt(&mined).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_confirmation_counts_inclusion_block() {
		let ledger = LocalLedger::new(0);
		let handle = ledger.handle();
		let hash = ledger.submit(tx(1)).await.unwrap();

		let receipt = ledger.wait_for_confirmation(&hash, 1).await.unwrap();
		assert_eq!(receipt.block_number, 1);

		let waiter = tokio::spawn({
			let ledger = LocalLedger {
				address: ledger.address,
				handle: handle.clone(),
			};
			let hash = hash.clone();
			async move { ledger.wait_for_confirmation(&hash, 3).await }
		});
		handle.advance(2);
		assert_eq!(waiter.await.unwrap().unwrap().block_number, 1);
	}

	#[test]
	fn test_factory_reads_balance() {
		let config = toml::Value::Table(
			"start_block = 7\nbalance_wei = \"1000\"".parse::<toml::Table>().unwrap(),
		);
		assert!(create_delivery(&config).is_ok());

		let bad = toml::Value::Table("address = \"0x12\"".parse::<toml::Table>().unwrap());
		assert!(create_delivery(&bad).is_err());
	}
}
