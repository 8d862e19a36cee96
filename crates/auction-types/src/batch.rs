//! Batch types for epoch auctions.
//!
//! A batch groups every ready intent of one market whose target block falls
//! into the same epoch. It is settled at a single clearing price.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{IntentId, TransactionHash};

/// Epoch of a block height for the given epoch size.
pub fn epoch_of(block: u64, epoch_size: u64) -> u64 {
	block / epoch_size.max(1)
}

/// First block after the given epoch.
pub fn epoch_end(epoch: u64, epoch_size: u64) -> u64 {
	epoch.saturating_add(1).saturating_mul(epoch_size.max(1))
}

/// Identifies a batch: one market within one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
	pub market: String,
	pub epoch: u64,
}

impl BatchKey {
	pub fn new(market: impl Into<String>, epoch: u64) -> Self {
		Self {
			market: market.into(),
			epoch,
		}
	}

	/// Stable identifier used for storage keys and the read boundary.
	pub fn id(&self) -> String {
		format!("{}@{}", self.market, self.epoch)
	}
}

impl fmt::Display for BatchKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.id())
	}
}

/// Where the settlement price of a batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
	/// The configured pricing strategy.
	Strategy,
	/// The external price oracle, explicitly configured as settlement input.
	Oracle,
}

/// Settlement progress of a closed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
	/// Price fixed, not yet submitted (or a previous submission failed).
	Closed,
	/// Settlement transaction submitted, confirmation outstanding.
	Settling { tx_hash: TransactionHash },
	/// Settlement confirmed on the ledger.
	Settled {
		tx_hash: TransactionHash,
		settlement_block: u64,
	},
	/// Settlement buried deeper than the finality depth.
	Archived {
		tx_hash: TransactionHash,
		settlement_block: u64,
	},
}

impl BatchStatus {
	pub fn name(&self) -> &'static str {
		match self {
			BatchStatus::Closed => "closed",
			BatchStatus::Settling { .. } => "settling",
			BatchStatus::Settled { .. } => "settled",
			BatchStatus::Archived { .. } => "archived",
		}
	}

	pub fn settlement_block(&self) -> Option<u64> {
		match self {
			BatchStatus::Settled {
				settlement_block, ..
			}
			| BatchStatus::Archived {
				settlement_block, ..
			} => Some(*settlement_block),
			_ => None,
		}
	}

	pub fn tx_hash(&self) -> Option<&TransactionHash> {
		match self {
			BatchStatus::Closed => None,
			BatchStatus::Settling { tx_hash }
			| BatchStatus::Settled { tx_hash, .. }
			| BatchStatus::Archived { tx_hash, .. } => Some(tx_hash),
		}
	}
}

/// A closed epoch batch. The clearing price never changes once computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
	pub key: BatchKey,
	/// Member intent ids, sorted.
	pub members: Vec<IntentId>,
	pub buy_volume: Decimal,
	pub sell_volume: Decimal,
	pub clearing_price: Decimal,
	/// Oracle quote recorded for audit.
	pub ai_price: Option<Decimal>,
	pub price_source: PriceSource,
	pub closed_at: u64,
	pub closed_at_block: u64,
	pub status: BatchStatus,
}

impl Batch {
	pub fn id(&self) -> String {
		self.key.id()
	}

	pub fn intent_count(&self) -> usize {
		self.members.len()
	}
}
