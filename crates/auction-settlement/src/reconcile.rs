//! Settlement reconciliation against the ledger.
//!
//! Run once per observed block. Confirms settlements whose wait was cut
//! short, undoes settlements that a reorg removed, and archives batches
//! buried below the finality depth.

use crate::{SettlementError, SettlementReport, SettlementService};
use auction_types::{Batch, BatchKey, BatchStatus, IntentId, TransactionHash};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// A settlement that disappeared from the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct RevertedSettlement {
	pub key: BatchKey,
	pub tx_hash: TransactionHash,
	/// Members returned to `Ready`.
	pub reverted: Vec<IntentId>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
	pub block: u64,
	pub finalized: Vec<SettlementReport>,
	pub reverted: Vec<RevertedSettlement>,
	/// Batches whose pending settlement reverted, back to `Closed`.
	pub reopened: Vec<BatchKey>,
	pub archived: Vec<BatchKey>,
	pub errors: usize,
}

impl SettlementService {
	/// Reconciles every batch with an outstanding or recent settlement.
	///
	/// Batches with a settlement in flight are left to that settlement.
	#[instrument(skip(self))]
	pub async fn reconcile(&self, current_block: u64) -> Result<ReconcileReport, SettlementError> {
		let mut report = ReconcileReport {
			block: current_block,
			..Default::default()
		};

		for batch in self.batches.list().await? {
			if matches!(batch.status, BatchStatus::Closed | BatchStatus::Archived { .. }) {
				continue;
			}
			let _guard = match self.claim(&batch.key) {
				Ok(guard) => guard,
				Err(_) => {
					debug!(batch_id = %batch.key, "settlement in flight, skipping");
					continue;
				}
			};
			if let Err(e) = self.reconcile_batch(&batch, current_block, &mut report).await {
				warn!(batch_id = %batch.key, error = %e, "reconciliation failed");
				report.errors += 1;
			}
		}

		if !report.reverted.is_empty() || !report.archived.is_empty() {
			info!(
				finalized = report.finalized.len(),
				reverted = report.reverted.len(),
				archived = report.archived.len(),
				"reconciled settlements"
			);
		}
		Ok(report)
	}

	async fn reconcile_batch(
		&self,
		batch: &Batch,
		current_block: u64,
		report: &mut ReconcileReport,
	) -> Result<(), SettlementError> {
		match &batch.status {
			BatchStatus::Settling { tx_hash } => match self.delivery.get_receipt(tx_hash).await? {
				Some(receipt) if receipt.success => {
					let depth = current_block.saturating_sub(receipt.block_number) + 1;
					if depth >= self.delivery.confirmations() {
						report.finalized.push(self.finalize(&batch.key, receipt).await?);
					}
				}
				Some(_) => {
					warn!(
						batch_id = %batch.key,
						tx_hash = %tx_hash.short(),
						"pending settlement reverted"
					);
					self.set_status(&batch.key, BatchStatus::Closed).await?;
					report.reopened.push(batch.key.clone());
				}
				None => {}
			},
			BatchStatus::Settled {
				tx_hash,
				settlement_block,
			} => {
				let included = self
					.delivery
					.get_receipt(tx_hash)
					.await?
					.is_some_and(|receipt| receipt.success);
				if !included {
					report
						.reverted
						.push(self.revert(batch, tx_hash.clone()).await?);
				} else if current_block >= settlement_block.saturating_add(self.finality_depth) {
					self.set_status(
						&batch.key,
						BatchStatus::Archived {
							tx_hash: tx_hash.clone(),
							settlement_block: *settlement_block,
						},
					)
					.await?;
					info!(batch_id = %batch.key, settlement_block, "batch archived");
					report.archived.push(batch.key.clone());
				}
			}
			BatchStatus::Closed | BatchStatus::Archived { .. } => {}
		}
		Ok(())
	}

	/// Returns the members settled by `tx_hash` to `Ready` and reopens the
	/// batch for settlement at its original price.
	async fn revert(
		&self,
		batch: &Batch,
		tx_hash: TransactionHash,
	) -> Result<RevertedSettlement, SettlementError> {
		let batch_id = batch.id();
		let mut reverted = Vec::new();
		for intent_id in &batch.members {
			match self.intents.revert_settlement(intent_id, &batch_id).await {
				Ok(_) => reverted.push(intent_id.clone()),
				// Conflicting members were never settled by this batch.
				Err(e) => debug!(%intent_id, error = %e, "member not reverted"),
			}
		}
		self.set_status(&batch.key, BatchStatus::Closed).await?;
		warn!(
			batch_id = %batch.key,
			tx_hash = %tx_hash.short(),
			reverted = reverted.len(),
			"settlement removed by reorg"
		);
		Ok(RevertedSettlement {
			key: batch.key.clone(),
			tx_hash,
			reverted,
		})
	}
}

#[cfg(test)]
mod tests {
	use crate::test_support::*;
	use crate::SettlementError;
	use auction_types::{BatchStatus, IntentStatus};
	use std::time::Duration;

	#[tokio::test]
	async fn test_reorged_settlement_returns_members_to_ready() {
		let fixture = fixture(1, Duration::from_secs(1));
		let batch = closed_batch(&fixture).await;
		let settled = fixture.service.settle(&batch.key).await.unwrap();

		assert!(fixture.ledger.drop_transaction(&settled.tx_hash));
		let report = fixture.service.reconcile(102).await.unwrap();
		assert_eq!(report.reverted.len(), 1);
		assert_eq!(report.reverted[0].reverted.len(), 2);

		for id in &batch.members {
			let intent = fixture.intents.get(id).await.unwrap();
			assert_eq!(intent.status(), IntentStatus::Ready);
		}
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert_eq!(stored.status, BatchStatus::Closed);
		assert_eq!(stored.clearing_price, batch.clearing_price);

		// The reopened batch settles again.
		let again = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(again.settled.len(), 2);
	}

	#[tokio::test]
	async fn test_archives_after_finality_depth() {
		let fixture = fixture(1, Duration::from_secs(1));
		let batch = closed_batch(&fixture).await;
		let settled = fixture.service.settle(&batch.key).await.unwrap();
		assert_eq!(settled.settlement_block, 101);

		let report = fixture.service.reconcile(105).await.unwrap();
		assert!(report.archived.is_empty());

		let report = fixture.service.reconcile(106).await.unwrap();
		assert_eq!(report.archived, vec![batch.key.clone()]);
		let stored = fixture.batches.get(&batch.key).await.unwrap().unwrap();
		assert!(matches!(stored.status, BatchStatus::Archived { settlement_block: 101, .. }));

		// Archived batches are no longer checked against the ledger.
		fixture.ledger.drop_transaction(&settled.tx_hash);
		let report = fixture.service.reconcile(107).await.unwrap();
		assert!(report.reverted.is_empty());
	}

	#[tokio::test]
	async fn test_finalizes_settlement_once_confirmed() {
		let fixture = fixture(3, Duration::from_millis(30));
		let batch = closed_batch(&fixture).await;
		assert!(matches!(
			fixture.service.settle(&batch.key).await,
			Err(SettlementError::AwaitingConfirmation { .. })
		));

		let report = fixture.service.reconcile(102).await.unwrap();
		assert!(report.finalized.is_empty());

		fixture.ledger.advance(2);
		let report = fixture.service.reconcile(103).await.unwrap();
		assert_eq!(report.finalized.len(), 1);
		assert_eq!(report.finalized[0].settled.len(), 2);
		assert_eq!(fixture.ledger.transaction_count(), 1);
	}
}
