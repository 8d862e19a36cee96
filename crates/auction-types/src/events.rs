//! Events broadcast between auction services.
//!
//! Events describe facts that already happened. Consumers such as the
//! metrics sink observe them but never feed back into the pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{BatchKey, FailureReason, IntentId, TransactionHash, UnlockEvidence};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuctionEvent {
	Intent(IntentEvent),
	Batch(BatchEvent),
	Settlement(SettlementEvent),
	Chain(ChainEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IntentEvent {
	Submitted {
		intent_id: IntentId,
		owner: String,
		target_block: u64,
	},
	Ready {
		intent_id: IntentId,
		market: String,
		unlock: UnlockEvidence,
	},
	Failed {
		intent_id: IntentId,
		reason: FailureReason,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchEvent {
	Closed {
		key: BatchKey,
		clearing_price: Decimal,
		ai_price: Option<Decimal>,
		intent_count: usize,
	},
	Archived {
		key: BatchKey,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SettlementEvent {
	Submitted {
		key: BatchKey,
		tx_hash: TransactionHash,
	},
	Confirmed {
		key: BatchKey,
		tx_hash: TransactionHash,
		settlement_block: u64,
		settled: usize,
	},
	Partial {
		key: BatchKey,
		conflicts: Vec<IntentId>,
	},
	Failed {
		key: BatchKey,
		error: String,
	},
	Reverted {
		key: BatchKey,
		tx_hash: TransactionHash,
		reverted: usize,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainEvent {
	BlockObserved { height: u64 },
	Reorg { previous: u64, height: u64 },
}

/// Broadcast bus for auction events.
pub struct EventBus {
	sender: broadcast::Sender<AuctionEvent>,
}

impl EventBus {
	/// Creates a bus that buffers up to `capacity` events per subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<AuctionEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event to all current subscribers.
	///
	/// Publishing without subscribers is not an error for the auction, so the
	/// send result is dropped.
	pub fn publish(&self, event: AuctionEvent) {
		let _ = self.sender.send(event);
	}
}

impl Clone for EventBus {
	fn clone(&self) -> Self {
		Self {
			sender: self.sender.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_subscribers_receive_published_events() {
		let bus = EventBus::new(8);
		let mut rx = bus.subscribe();

		bus.publish(AuctionEvent::Chain(ChainEvent::BlockObserved { height: 7 }));

		match rx.recv().await.unwrap() {
			AuctionEvent::Chain(ChainEvent::BlockObserved { height }) => assert_eq!(height, 7),
			other => panic!("unexpected event {:?}", other),
		}
	}

	#[test]
	fn test_publish_without_subscribers_is_silent() {
		let bus = EventBus::new(1);
		bus.publish(AuctionEvent::Chain(ChainEvent::BlockObserved { height: 1 }));
	}
}
