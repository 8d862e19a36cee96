//! Settlement dispatcher.
//!
//! Submits one settlement transaction per closed batch and moves the
//! batch's members to `Settled` once it confirms. At most one settlement per
//! batch key is in flight at any time. A submitted hash is persisted before
//! waiting, so a retry checks that transaction instead of sending another.

use alloy::primitives::Address;
use auction_delivery::calldata::settle_batch_transaction;
use auction_delivery::{DeliveryError, DeliveryService};
use auction_storage::{BatchStore, BatchStoreError, IntentStore, IntentStoreError};
use auction_types::{
	Batch, BatchKey, BatchStatus, IntentId, IntentState, IntentStatus, TransactionHash,
	TransactionReceipt,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

mod reconcile;

pub use reconcile::{ReconcileReport, RevertedSettlement};

#[derive(Debug, Error)]
pub enum SettlementError {
	#[error("Settlement of {0} is already pending")]
	AlreadyInFlight(String),
	#[error("Batch {batch_id} is already settled by {tx_hash}")]
	AlreadySettled {
		batch_id: String,
		tx_hash: TransactionHash,
	},
	#[error("Settlement {tx_hash} of {batch_id} is awaiting confirmation")]
	AwaitingConfirmation {
		batch_id: String,
		tx_hash: TransactionHash,
	},
	#[error("Settlement {tx_hash} of {batch_id} reverted")]
	Reverted {
		batch_id: String,
		tx_hash: TransactionHash,
	},
	#[error("Batch {0} not found")]
	NotFound(String),
	#[error(transparent)]
	Delivery(#[from] DeliveryError),
	#[error(transparent)]
	Batches(#[from] BatchStoreError),
	#[error(transparent)]
	Intents(#[from] IntentStoreError),
}

/// Outcome of a confirmed settlement.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
	pub key: BatchKey,
	pub tx_hash: TransactionHash,
	pub settlement_block: u64,
	pub clearing_price: Decimal,
	pub settled: Vec<IntentId>,
	/// Members that could not be moved to `Settled`.
	pub conflicts: Vec<IntentId>,
}

impl SettlementReport {
	pub fn is_partial(&self) -> bool {
		!self.conflicts.is_empty()
	}
}

/// Releases a batch key's in-flight claim when dropped.
pub(crate) struct InFlightGuard {
	claims: Arc<DashMap<BatchKey, ()>>,
	key: BatchKey,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.claims.remove(&self.key);
	}
}

pub struct SettlementService {
	intents: Arc<IntentStore>,
	batches: Arc<BatchStore>,
	delivery: Arc<DeliveryService>,
	contract: Address,
	chain_id: u64,
	finality_depth: u64,
	in_flight: Arc<DashMap<BatchKey, ()>>,
}

impl SettlementService {
	pub fn new(
		intents: Arc<IntentStore>,
		batches: Arc<BatchStore>,
		delivery: Arc<DeliveryService>,
		contract: Address,
		chain_id: u64,
		finality_depth: u64,
	) -> Self {
		Self {
			intents,
			batches,
			delivery,
			contract,
			chain_id,
			finality_depth,
			in_flight: Arc::new(DashMap::new()),
		}
	}

	/// Keys with a settlement currently being dispatched or reconciled.
	pub fn in_flight(&self) -> Vec<BatchKey> {
		self.in_flight.iter().map(|entry| entry.key().clone()).collect()
	}

	pub(crate) fn claim(&self, key: &BatchKey) -> Result<InFlightGuard, SettlementError> {
		match self.in_flight.entry(key.clone()) {
			Entry::Occupied(_) => Err(SettlementError::AlreadyInFlight(key.id())),
			Entry::Vacant(slot) => {
				slot.insert(());
				Ok(InFlightGuard {
					claims: self.in_flight.clone(),
					key: key.clone(),
				})
			}
		}
	}

	/// Settles the closed batch stored under `key`.
	///
	/// Fails with `AlreadyInFlight` while another settlement of the key runs.
	/// A failed submission leaves the batch `Closed` with its price
	/// unchanged, ready for another call.
	#[instrument(skip(self), fields(batch_id = %key))]
	pub async fn settle(&self, key: &BatchKey) -> Result<SettlementReport, SettlementError> {
		let _guard = self.claim(key)?;

		let batch = self.load(key).await?;
		let batch = match batch.status.clone() {
			BatchStatus::Settled { tx_hash, .. } | BatchStatus::Archived { tx_hash, .. } => {
				return Err(SettlementError::AlreadySettled {
					batch_id: batch.id(),
					tx_hash,
				});
			}
			BatchStatus::Settling { tx_hash } => {
				let receipt = match self.delivery.get_receipt(&tx_hash).await? {
					// Included, but finalized only at the configured depth.
					Some(receipt) if receipt.success => {
						match self.delivery.confirm(&tx_hash).await {
							Ok(receipt) => Some(receipt),
							Err(e) => {
								warn!(
									tx_hash = %tx_hash.short(),
									error = %e,
									"settlement not deep enough yet"
								);
								None
							}
						}
					}
					other => other,
				};
				match receipt {
					Some(receipt) if receipt.success => return self.finalize(key, receipt).await,
					Some(_) => {
						warn!(
							tx_hash = %tx_hash.short(),
							"previous settlement reverted, resubmitting"
						);
						self.set_status(key, BatchStatus::Closed).await?
					}
					None => {
						return Err(SettlementError::AwaitingConfirmation {
							batch_id: batch.id(),
							tx_hash,
						});
					}
				}
			}
			BatchStatus::Closed => batch,
		};

		let tx = settle_batch_transaction(self.contract, self.chain_id, &batch)?;
		let tx_hash = self.delivery.deliver(tx).await?;
		self.set_status(
			key,
			BatchStatus::Settling {
				tx_hash: tx_hash.clone(),
			},
		)
		.await?;
		info!(tx_hash = %tx_hash.short(), intents = batch.intent_count(), "settlement submitted");

		match self.delivery.confirm(&tx_hash).await {
			Ok(receipt) if receipt.success => self.finalize(key, receipt).await,
			Ok(_) => {
				self.set_status(key, BatchStatus::Closed).await?;
				warn!(tx_hash = %tx_hash.short(), "settlement reverted");
				Err(SettlementError::Reverted {
					batch_id: key.id(),
					tx_hash,
				})
			}
			Err(e) => {
				warn!(tx_hash = %tx_hash.short(), error = %e, "settlement not confirmed yet");
				Err(SettlementError::AwaitingConfirmation {
					batch_id: key.id(),
					tx_hash,
				})
			}
		}
	}

	pub(crate) async fn load(&self, key: &BatchKey) -> Result<Batch, SettlementError> {
		self.batches
			.get(key)
			.await?
			.ok_or_else(|| SettlementError::NotFound(key.id()))
	}

	pub(crate) async fn set_status(
		&self,
		key: &BatchKey,
		status: BatchStatus,
	) -> Result<Batch, SettlementError> {
		let current = self
			.batches
			.get_versioned(key)
			.await?
			.ok_or_else(|| SettlementError::NotFound(key.id()))?;
		let mut next = current.value.clone();
		next.status = status;
		Ok(self.batches.update(&current, next).await?)
	}

	/// Applies a successful receipt: every member goes `Ready -> Settled`,
	/// then the batch is marked settled.
	///
	/// Members are settled one by one. A member that cannot be moved is
	/// reported as a conflict and the others stay settled.
	pub(crate) async fn finalize(
		&self,
		key: &BatchKey,
		receipt: TransactionReceipt,
	) -> Result<SettlementReport, SettlementError> {
		let batch = self.load(key).await?;
		let batch_id = batch.id();
		let mut settled = Vec::new();
		let mut conflicts = Vec::new();

		for intent_id in &batch.members {
			let intent = match self.intents.get(intent_id).await {
				Ok(intent) => intent,
				Err(e) => {
					warn!(%intent_id, error = %e, "member unreadable");
					conflicts.push(intent_id.clone());
					continue;
				}
			};

			let (decrypted, unlock) = match intent.state {
				IntentState::Ready { decrypted, unlock } => (decrypted, unlock),
				IntentState::Settled {
					batch_id: ref settled_in,
					..
				} if *settled_in == batch_id => {
					settled.push(intent_id.clone());
					continue;
				}
				other => {
					warn!(%intent_id, status = %other.status(), "member is not ready");
					conflicts.push(intent_id.clone());
					continue;
				}
			};

			let result = self
				.intents
				.transition(
					intent_id,
					IntentStatus::Ready,
					IntentState::Settled {
						decrypted,
						unlock,
						batch_id: batch_id.clone(),
						inclusion_block: receipt.block_number,
						settlement_price: batch.clearing_price,
						tx_hash: receipt.hash.clone(),
					},
					Default::default(),
				)
				.await;
			match result {
				Ok(_) => settled.push(intent_id.clone()),
				Err(e) => {
					warn!(%intent_id, error = %e, "member changed concurrently");
					conflicts.push(intent_id.clone());
				}
			}
		}

		self.set_status(
			key,
			BatchStatus::Settled {
				tx_hash: receipt.hash.clone(),
				settlement_block: receipt.block_number,
			},
		)
		.await?;

		if conflicts.is_empty() {
			info!(
				tx_hash = %receipt.hash.short(),
				block = receipt.block_number,
				settled = settled.len(),
				"batch settled"
			);
		} else {
			warn!(
				tx_hash = %receipt.hash.short(),
				settled = settled.len(),
				conflicts = conflicts.len(),
				"batch partially settled"
			);
		}

		Ok(SettlementReport {
			key: key.clone(),
			tx_hash: receipt.hash,
			settlement_block: receipt.block_number,
			clearing_price: batch.clearing_price,
			settled,
			conflicts,
		})
	}

	pub fn finality_depth(&self) -> u64 {
		self.finality_depth
	}
}


#[cfg(test)]
mod tests {
	use super::test_support::*;
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn test_settles_every_member_at_clearing_price() {
		let fixture = fixture(1, Duration::from_secs(1));
		let batch = closed_batch(&fixture).await;

		let report = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(report.settled.len(), 2);
		assert!(!report.is_partial());
		assert_eq!(report.settlement_block, 101);

		for id in &batch.members {
			let intent = fixture.intents.get(id).await.unwrap();
			assert_eq!(intent.state.inclusion_block(), Some(101));
			assert_eq!(intent.state.settlement_price(), Some(Decimal::from(2000)));
		}
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert_eq!(stored.status.settlement_block(), Some(101));

		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::AlreadySettled { .. })
		));
		assert_eq!(fixture.ledger.transaction_count(), 1);
	}

	#[tokio::test]
	async fn test_second_settle_while_pending_is_rejected() {
		let fixture = fixture(2, Duration::from_secs(5));
		let batch = closed_batch(&fixture).await;

		let first = tokio::spawn({
			let service = fixture.service.clone();
			let key = batch.key.clone();
			async move { service.settle(&key).await }
		});
		while fixture.service.in_flight().is_empty() {
			tokio::time::sleep(Duration::from_millis(1)).await;
		}

		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::AlreadyInFlight(_))
		));

		fixture.ledger.advance(1);
		let report = first.await.unwrap().unwrap();
		assert_eq!(report.settled.len(), 2);
		assert_eq!(fixture.ledger.transaction_count(), 1);
		assert!(fixture.service.in_flight().is_empty());
	}

	#[tokio::test]
	async fn test_failed_submission_keeps_batch_closed() {
		let fixture = fixture(1, Duration::from_secs(1));
		let batch = closed_batch(&fixture).await;
		fixture.ledger.fail_next_submissions(1);

		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::Delivery(_))
		));
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert_eq!(stored.status, BatchStatus::Closed);

		let report = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(report.clearing_price, batch.clearing_price);
	}

	#[tokio::test]
	async fn test_reverted_settlement_can_be_retried() {
		let fixture = fixture(1, Duration::from_secs(1));
		let batch = closed_batch(&fixture).await;
		fixture.ledger.revert_next_submissions(1);

		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::Reverted { .. })
		));
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert_eq!(stored.status, BatchStatus::Closed);
		for id in &batch.members {
			assert_eq!(
				fixture.intents.get(id).await.unwrap().status(),
				IntentStatus::Ready
			);
		}

		let report = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(report.settlement_block, 102);
	}

	#[tokio::test]
	async fn test_unconfirmed_settlement_is_not_resubmitted() {
		let fixture = fixture(3, Duration::from_millis(30));
		let batch = closed_batch(&fixture).await;

		let err = fixture.service.settle(&batch.key).await.unwrap_err();
		let SettlementError::AwaitingConfirmation { tx_hash, .. } = err else {
			panic!("expected awaiting confirmation, got {err:?}");
		};
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert_eq!(stored.status, BatchStatus::Settling { tx_hash: tx_hash.clone() });

		fixture.ledger.advance(2);
		let report = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(report.tx_hash, tx_hash);
		assert_eq!(fixture.ledger.transaction_count(), 1);
	}

	#[tokio::test]
	async fn test_retry_waits_for_confirmation_depth() {
		let fixture = fixture(3, Duration::from_millis(30));
		let batch = closed_batch(&fixture).await;
		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::AwaitingConfirmation { .. })
		));

		// Mined at 101, head 102: two of three confirmations.
		fixture.ledger.advance(1);
		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::AwaitingConfirmation { .. })
		));
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert!(matches!(stored.status, BatchStatus::Settling { .. }));
		for id in &batch.members {
			assert_eq!(
				fixture.intents.get(id).await.unwrap().status(),
				IntentStatus::Ready
			);
		}

		fixture.ledger.advance(1);
		let report = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(report.settlement_block, 101);
		assert_eq!(fixture.ledger.transaction_count(), 1);
	}

	#[tokio::test]
	async fn test_member_conflict_is_partial_not_fatal() {
		let fixture = fixture(1, Duration::from_secs(1));
		let batch = closed_batch(&fixture).await;

		// Another writer settles one member elsewhere first.
		let taken = &batch.members[0];
		let intent = fixture.intents.get(taken).await.unwrap();
		let IntentState::Ready { decrypted, unlock } = intent.state else {
			panic!("member should be ready");
		};
		fixture
			.intents
			.transition(
				taken,
				IntentStatus::Ready,
				IntentState::Settled {
					decrypted,
					unlock,
					batch_id: "other@0".to_string(),
					inclusion_block: 99,
					settlement_price: Decimal::ONE,
					tx_hash: TransactionHash(vec![1; 32]),
				},
				Default::default(),
			)
			.await
			.unwrap();

		let report = fixture.service.settle(&batch.key).await.unwrap();
		assert!(report.is_partial());
		assert_eq!(report.conflicts, vec![taken.clone()]);
		assert_eq!(report.settled, vec![batch.members[1].clone()]);
	}
}
