//! Eligibility scanner.
//!
//! Per-intent state machine applied on every scan:
//!
//! - target block reached, oracle opens a valid payload: `Pending -> Ready`
//! - oracle rejects the ciphertext or the payload is invalid: `Pending -> Failed`
//! - still sealed: `Pending -> Pending` with one more attempt recorded, and
//!   `Pending -> Failed` once the attempt ceiling is reached
//! - oracle unreachable: skipped, no attempt recorded
//!
//! Every change is a CAS transition, so overlapping scans of the same intent
//! apply it once and the loser only counts a conflict.

use crate::ScannerError;
use auction_storage::{IntentPatch, IntentStore, IntentStoreError};
use auction_timelock::{OpenOutcome, TimelockService};
use auction_types::{
	DecryptedIntent, FailureReason, Intent, IntentState, IntentStatus, UnlockEvidence,
};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What one scan did.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
	pub block: u64,
	/// Pending intents whose target block was reached.
	pub considered: usize,
	pub opened: Vec<Intent>,
	pub failed: Vec<Intent>,
	pub still_sealed: usize,
	/// Skipped because the oracle was unreachable.
	pub deferred: usize,
	/// Lost a CAS race to a concurrent writer.
	pub conflicts: usize,
	pub errors: usize,
}

enum Attempt {
	Opened(Intent),
	Failed(Intent),
	StillSealed,
	Deferred,
	Conflict,
	Error,
}

pub struct EligibilityScanner {
	store: Arc<IntentStore>,
	timelock: Arc<TimelockService>,
	max_open_attempts: u32,
	concurrency: usize,
}

impl EligibilityScanner {
	pub fn new(
		store: Arc<IntentStore>,
		timelock: Arc<TimelockService>,
		max_open_attempts: u32,
		concurrency: usize,
	) -> Self {
		Self {
			store,
			timelock,
			max_open_attempts: max_open_attempts.max(1),
			concurrency: concurrency.max(1),
		}
	}

	/// Tries to open every pending intent with `target_block <= current_block`.
	///
	/// `current_block` may be lower than in a previous scan. That only shrinks
	/// the set of candidates; intents that already left `Pending` are never
	/// touched here.
	#[instrument(skip(self))]
	pub async fn scan(&self, current_block: u64) -> Result<ScanReport, ScannerError> {
		let candidates: Vec<Intent> = self
			.store
			.list_by_status(IntentStatus::Pending)
			.await?
			.into_iter()
			.filter(|intent| intent.target_block <= current_block)
			.collect();

		let mut report = ScanReport {
			block: current_block,
			considered: candidates.len(),
			..Default::default()
		};
		if candidates.is_empty() {
			return Ok(report);
		}

		let outcomes: Vec<Attempt> = stream::iter(candidates)
			.map(|intent| self.attempt(intent, current_block))
			.buffer_unordered(self.concurrency)
			.collect()
			.await;

		for outcome in outcomes {
			match outcome {
				Attempt::Opened(intent) => report.opened.push(intent),
				Attempt::Failed(intent) => report.failed.push(intent),
				Attempt::StillSealed => report.still_sealed += 1,
				Attempt::Deferred => report.deferred += 1,
				Attempt::Conflict => report.conflicts += 1,
				Attempt::Error => report.errors += 1,
			}
		}

		info!(
			block = current_block,
			considered = report.considered,
			opened = report.opened.len(),
			failed = report.failed.len(),
			still_sealed = report.still_sealed,
			deferred = report.deferred,
			conflicts = report.conflicts,
			"scan complete"
		);
		Ok(report)
	}

	async fn attempt(&self, intent: Intent, current_block: u64) -> Attempt {
		let outcome = match self
			.timelock
			.try_open(&intent.ciphertext, current_block)
			.await
		{
			Ok(outcome) => outcome,
			Err(e) => {
				warn!(intent_id = %intent.id, error = %e, "oracle unavailable, deferring");
				return Attempt::Deferred;
			}
		};

		let (next, patch) = match outcome {
			OpenOutcome::Opened {
				payload,
				unlock_block,
			} => (
				self.opened_state(&intent, &payload, unlock_block, current_block),
				IntentPatch::default(),
			),
			OpenOutcome::StillSealed => {
				let attempts = intent.open_attempts.saturating_add(1);
				let patch = IntentPatch {
					open_attempts: Some(attempts),
				};
				if attempts >= self.max_open_attempts {
					(
						IntentState::Failed {
							reason: FailureReason::StillSealed { attempts },
						},
						patch,
					)
				} else {
					debug!(intent_id = %intent.id, attempts, "still sealed");
					(IntentState::Pending, patch)
				}
			}
			OpenOutcome::Corrupt(message) => (
				IntentState::Failed {
					reason: FailureReason::CorruptCiphertext { message },
				},
				IntentPatch::default(),
			),
		};

		match self
			.store
			.transition(&intent.id, IntentStatus::Pending, next, patch)
			.await
		{
			Ok(updated) => match updated.status() {
				IntentStatus::Ready => {
					info!(intent_id = %updated.id, "intent opened");
					Attempt::Opened(updated)
				}
				IntentStatus::Failed => {
					if let IntentState::Failed { reason } = &updated.state {
						warn!(intent_id = %updated.id, %reason, "intent failed");
					}
					Attempt::Failed(updated)
				}
				_ => Attempt::StillSealed,
			},
			Err(IntentStoreError::StaleState { .. }) => {
				debug!(intent_id = %intent.id, "intent changed concurrently");
				Attempt::Conflict
			}
			Err(e) => {
				warn!(intent_id = %intent.id, error = %e, "failed to record scan result");
				Attempt::Error
			}
		}
	}

	/// Validates an opened payload against the intent's declared condition.
	fn opened_state(
		&self,
		intent: &Intent,
		payload: &[u8],
		reported_unlock: Option<u64>,
		current_block: u64,
	) -> IntentState {
		let unlock = match reported_unlock {
			Some(revealed_block) if revealed_block != intent.target_block => {
				return IntentState::Failed {
					reason: FailureReason::ConditionMismatch {
						target_block: intent.target_block,
						revealed_block,
					},
				};
			}
			Some(block) => UnlockEvidence::Reported(block),
			None => UnlockEvidence::Inferred(current_block),
		};

		match DecryptedIntent::from_payload(payload) {
			Ok(decrypted) => IntentState::Ready { decrypted, unlock },
			Err(message) => IntentState::Failed {
				reason: FailureReason::MalformedPayload { message },
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use auction_storage::implementations::memory::MemoryStorage;
	use auction_storage::StorageService;
	use auction_timelock::implementations::local::LocalTimelock;
	use auction_timelock::{TimelockError, TimelockInterface};
	use auction_types::{Ciphertext, ConfigSchema, RetryPolicy, Schema, Side};
	use rust_decimal::Decimal;
	use std::time::Duration;

	const PAYLOAD: &[u8] = br#"{"market":"ETH/USDC","side":"buy","amount":"1.0","slippageBps":50}"#;

	fn timelock(oracle: Box<dyn TimelockInterface>) -> Arc<TimelockService> {
		Arc::new(
			TimelockService::new(oracle, Duration::from_secs(1), 0)
				.with_retry_policy(RetryPolicy::default().with_max_retries(0)),
		)
	}

	fn store() -> Arc<IntentStore> {
		Arc::new(IntentStore::new(Arc::new(StorageService::new(Box::new(
			MemoryStorage::new(),
		)))))
	}

	struct Harness {
		store: Arc<IntentStore>,
		timelock: Arc<TimelockService>,
		scanner: EligibilityScanner,
	}

	impl Harness {
		fn new(oracle: LocalTimelock, max_attempts: u32) -> Self {
			let store = store();
			let timelock = timelock(Box::new(oracle));
			let scanner = EligibilityScanner::new(store.clone(), timelock.clone(), max_attempts, 4);
			Self {
				store,
				timelock,
				scanner,
			}
		}

		async fn submit(&self, payload: &[u8], seal_for: u64, declared_target: u64) -> Intent {
			let ciphertext = self.timelock.seal(payload, seal_for, 50).await.unwrap();
			self.store
				.create("0xowner", declared_target, ciphertext, 50, None)
				.await
				.unwrap()
		}
	}

	#[tokio::test]
	async fn test_intent_opens_at_target_block() {
		let h = Harness::new(LocalTimelock::new("s", true, 0), 5);
		let intent = h.submit(PAYLOAD, 100, 100).await;

		let early = h.scanner.scan(99).await.unwrap();
		assert_eq!(early.considered, 0);

		let report = h.scanner.scan(100).await.unwrap();
		assert_eq!(report.opened.len(), 1);

		let stored = h.store.get(&intent.id).await.unwrap();
		let IntentState::Ready { decrypted, unlock } = stored.state else {
			panic!("expected ready, got {:?}", stored.state);
		};
		assert_eq!(decrypted.market, "ETH/USDC");
		assert_eq!(decrypted.side, Side::Buy);
		assert_eq!(decrypted.amount, Decimal::new(10, 1));
		assert_eq!(unlock, UnlockEvidence::Reported(100));
	}

	#[tokio::test]
	async fn test_reorg_never_regresses_ready_intent() {
		let h = Harness::new(LocalTimelock::new("s", true, 0), 5);
		let intent = h.submit(PAYLOAD, 100, 100).await;
		h.scanner.scan(100).await.unwrap();

		let report = h.scanner.scan(98).await.unwrap();
		assert_eq!(report.considered, 0);
		assert_eq!(
			h.store.get(&intent.id).await.unwrap().status(),
			IntentStatus::Ready
		);
	}

	#[tokio::test]
	async fn test_permanent_failures() {
		let h = Harness::new(LocalTimelock::new("s", true, 0), 5);
		let malformed = h.submit(b"not an intent", 100, 100).await;
		let mismatched = h.submit(PAYLOAD, 90, 100).await;
		let corrupt = h
			.store
			.create("0xowner", 100, Ciphertext(vec![0xde, 0xad]), 50, None)
			.await
			.unwrap();

		let report = h.scanner.scan(100).await.unwrap();
		assert_eq!(report.failed.len(), 3);

		let reason = |intent: Intent| match intent.state {
			IntentState::Failed { reason } => reason,
			other => panic!("expected failed, got {:?}", other),
		};
		assert!(matches!(
			reason(h.store.get(&malformed.id).await.unwrap()),
			FailureReason::MalformedPayload { .. }
		));
		assert_eq!(
			reason(h.store.get(&mismatched.id).await.unwrap()),
			FailureReason::ConditionMismatch {
				target_block: 100,
				revealed_block: 90
			}
		);
		assert!(matches!(
			reason(h.store.get(&corrupt.id).await.unwrap()),
			FailureReason::CorruptCiphertext { .. }
		));
	}

	#[tokio::test]
	async fn test_still_sealed_is_bounded() {
		let h = Harness::new(LocalTimelock::new("s", true, 10), 2);
		let intent = h.submit(PAYLOAD, 100, 100).await;

		let first = h.scanner.scan(100).await.unwrap();
		assert_eq!(first.still_sealed, 1);
		let pending = h.store.get(&intent.id).await.unwrap();
		assert_eq!(pending.status(), IntentStatus::Pending);
		assert_eq!(pending.open_attempts, 1);

		let second = h.scanner.scan(101).await.unwrap();
		assert_eq!(second.failed.len(), 1);
		assert!(matches!(
			h.store.get(&intent.id).await.unwrap().state,
			IntentState::Failed {
				reason: FailureReason::StillSealed { attempts: 2 }
			}
		));
	}

	#[tokio::test]
	async fn test_unreported_unlock_is_inferred() {
		let h = Harness::new(LocalTimelock::new("s", false, 0), 5);
		let intent = h.submit(PAYLOAD, 100, 100).await;

		h.scanner.scan(103).await.unwrap();
		let stored = h.store.get(&intent.id).await.unwrap();
		assert!(matches!(
			stored.state,
			IntentState::Ready {
				unlock: UnlockEvidence::Inferred(103),
				..
			}
		));
	}

	struct OfflineOracle;

	#[async_trait]
	impl TimelockInterface for OfflineOracle {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(Schema::empty())
		}

		async fn seal(&self, _: &[u8], _: u64) -> Result<Ciphertext, TimelockError> {
			Err(TimelockError::EncryptionUnavailable("offline".into()))
		}

		async fn try_open(&self, _: &Ciphertext, _: u64) -> Result<OpenOutcome, TimelockError> {
			Err(TimelockError::EncryptionUnavailable("offline".into()))
		}
	}

	#[tokio::test]
	async fn test_outage_defers_without_consuming_attempts() {
		let store = store();
		let intent = store
			.create("0xowner", 100, Ciphertext(vec![1, 2, 3]), 50, None)
			.await
			.unwrap();
		let scanner =
			EligibilityScanner::new(store.clone(), timelock(Box::new(OfflineOracle)), 1, 4);

		let report = scanner.scan(100).await.unwrap();
		assert_eq!(report.deferred, 1);

		let stored = store.get(&intent.id).await.unwrap();
		assert_eq!(stored.status(), IntentStatus::Pending);
		assert_eq!(stored.open_attempts, 0);
	}

	#[tokio::test]
	async fn test_overlapping_scans_open_once() {
		let h = Harness::new(LocalTimelock::new("s", true, 0), 5);
		for _ in 0..5 {
			h.submit(PAYLOAD, 100, 100).await;
		}

		let (a, b) = tokio::join!(h.scanner.scan(100), h.scanner.scan(100));
		let (a, b) = (a.unwrap(), b.unwrap());

		assert_eq!(a.opened.len() + b.opened.len(), 5);
		assert_eq!(
			h.store
				.list_by_status(IntentStatus::Ready)
				.await
				.unwrap()
				.len(),
			5
		);
	}
}
