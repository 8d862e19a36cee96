//! Ledger transaction types.
//!
//! This module defines the transactions the auction submits to the ledger
//! (intent submissions and batch settlements), their hashes and receipts.

use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger transaction hash.
///
/// Stores transaction hashes as raw bytes to support different ledger formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionHash(#[serde(with = "crate::serde_hex")] pub Vec<u8>);

impl fmt::Display for TransactionHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", crate::serde_hex::encode(&self.0))
	}
}

impl TransactionHash {
	/// Shortened form for log lines.
	pub fn short(&self) -> String {
		let hash_str = hex::encode(&self.0);
		if hash_str.len() <= 8 {
			hash_str
		} else {
			format!("{}..", &hash_str[..8])
		}
	}
}

/// Transaction receipt containing execution details.
///
/// Provides information about a transaction after it has been included in a block,
/// including its success status and block number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
	/// The hash of the transaction.
	pub hash: TransactionHash,
	/// The block number where the transaction was included.
	pub block_number: u64,
	/// Whether the transaction executed successfully.
	pub success: bool,
}

/// What a transaction does, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
	IntentSubmission,
	BatchSettlement,
}

/// A ledger transaction ready for submission.
#[derive(Debug, Clone)]
pub struct Transaction {
	/// Contract the calldata is sent to.
	pub to: Option<Address>,
	/// ABI-encoded calldata.
	pub data: Vec<u8>,
	/// Value to transfer in native currency.
	pub value: U256,
	/// Chain ID for replay protection.
	pub chain_id: u64,
	/// Gas limit, filled by the provider when absent.
	pub gas_limit: Option<u64>,
	pub kind: TransactionKind,
}

/// Conversion from our Transaction type to Alloy's TransactionRequest.
impl From<Transaction> for TransactionRequest {
	fn from(tx: Transaction) -> Self {
		TransactionRequest {
			chain_id: Some(tx.chain_id),
			value: Some(tx.value),
			to: tx.to.map(TxKind::Call),
			gas: tx.gas_limit,
			input: TransactionInput::new(Bytes::from(tx.data)),
			..Default::default()
		}
	}
}
