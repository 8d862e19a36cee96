//! The auction engine.
//!
//! Wires the pipeline stages together: intents are sealed and recorded, the
//! scanner opens them as blocks arrive, batches are closed and priced, and
//! the settlement dispatcher settles and reconciles them. Every step is
//! published on the [`EventBus`].

use alloy::primitives::Address;
use auction_batch::{BatchError, BatchService};
use auction_config::Config;
use auction_delivery::calldata::submit_intent_transaction;
use auction_delivery::{DeliveryError, DeliveryService};
use auction_monitoring::{spawn_event_sink, AuctionMetrics};
use auction_scanner::{
	BlockMonitor, BlockSourceInterface, EligibilityScanner, ScanReport, ScannerError,
};
use auction_settlement::{ReconcileReport, SettlementError, SettlementReport, SettlementService};
use auction_storage::{BatchStore, BatchStoreError, IntentStore, IntentStoreError};
use auction_timelock::{TimelockError, TimelockService};
use auction_types::{
	epoch_end, normalize_owner, AuctionEvent, Batch, BatchEvent, BatchKey, BatchStatus,
	ChainEvent, Ciphertext, DecryptedIntent, EventBus, Intent, IntentEvent, IntentState,
	SettlementEvent, TransactionHash,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

mod builder;

pub use builder::AuctionBuilder;

#[derive(Debug, Error)]
pub enum AuctionError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Invalid input: {0}")]
	InvalidInput(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("{0} is not an allowed operator")]
	Unauthorized(Address),
	#[error(transparent)]
	Timelock(TimelockError),
	#[error(transparent)]
	Intents(IntentStoreError),
	#[error(transparent)]
	Batches(#[from] BatchStoreError),
	#[error(transparent)]
	Batch(#[from] BatchError),
	#[error(transparent)]
	Settlement(#[from] SettlementError),
	#[error(transparent)]
	Delivery(#[from] DeliveryError),
	#[error(transparent)]
	Scanner(#[from] ScannerError),
	#[error("Service error: {0}")]
	Service(String),
}

impl From<IntentStoreError> for AuctionError {
	fn from(e: IntentStoreError) -> Self {
		match e {
			IntentStoreError::NotFound(id) => AuctionError::NotFound(format!("intent {}", id)),
			IntentStoreError::InvalidTargetBlock { .. } | IntentStoreError::InvalidInput(_) => {
				AuctionError::InvalidInput(e.to_string())
			}
			other => AuctionError::Intents(other),
		}
	}
}

impl From<TimelockError> for AuctionError {
	fn from(e: TimelockError) -> Self {
		match e {
			TimelockError::InvalidCondition { .. } => AuctionError::InvalidInput(e.to_string()),
			other => AuctionError::Timelock(other),
		}
	}
}

/// Public view of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
	pub id: String,
	pub market: String,
	pub epoch: u64,
	pub clearing_price: Decimal,
	pub ai_price: Option<Decimal>,
	pub intent_count: usize,
	pub status: &'static str,
	pub settlement_block: Option<u64>,
	pub tx_hash: Option<TransactionHash>,
}

impl From<&Batch> for BatchSummary {
	fn from(batch: &Batch) -> Self {
		Self {
			id: batch.id(),
			market: batch.key.market.clone(),
			epoch: batch.key.epoch,
			clearing_price: batch.clearing_price,
			ai_price: batch.ai_price,
			intent_count: batch.intent_count(),
			status: batch.status.name(),
			settlement_block: batch.status.settlement_block(),
			tx_hash: batch.status.tx_hash().cloned(),
		}
	}
}

/// What the engine did for one observed block.
#[derive(Debug, Default)]
pub struct BlockReport {
	pub height: u64,
	pub reorg: bool,
	pub scan: ScanReport,
	pub reconcile: ReconcileReport,
	/// Keys handed to the settlement dispatcher by the scheduler.
	pub scheduled: Vec<BatchKey>,
}

pub struct AuctionEngine {
	config: Config,
	intents: Arc<IntentStore>,
	batches: Arc<BatchStore>,
	timelock: Arc<TimelockService>,
	scanner: EligibilityScanner,
	batch: Arc<BatchService>,
	delivery: Arc<DeliveryService>,
	settlement: Arc<SettlementService>,
	source: Arc<dyn BlockSourceInterface>,
	monitor: BlockMonitor,
	operators: HashSet<Address>,
	contract: Address,
	event_bus: EventBus,
	metrics: Arc<AuctionMetrics>,
	head: Mutex<Option<u64>>,
}

impl AuctionEngine {
	/// Runs the block loop until ctrl-c.
	pub async fn run(&self) -> Result<(), AuctionError> {
		let (block_tx, mut block_rx) = mpsc::unbounded_channel();
		self.monitor.start_monitoring(block_tx).await?;

		let sink = spawn_event_sink(&self.event_bus, self.metrics.clone());
		let poller = self.spawn_balance_poller();

		loop {
			tokio::select! {
				Some(observation) = block_rx.recv() => {
					if let Err(e) = self.on_block(observation.height).await {
						error!(height = observation.height, error = %e, "block processing failed");
					}
				}

				_ = tokio::signal::ctrl_c() => {
					info!("Shutting down auction engine");
					break;
				}
			}
		}

		self.monitor.stop_monitoring().await?;
		if let Some(poller) = poller {
			poller.abort();
		}
		sink.abort();
		Ok(())
	}

	fn spawn_balance_poller(&self) -> Option<JoinHandle<()>> {
		let seconds = self.config.monitoring.balance_poll_seconds;
		if seconds == 0 {
			return None;
		}
		let delivery = self.delivery.clone();
		let metrics = self.metrics.clone();
		Some(tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(seconds));
			loop {
				interval.tick().await;
				match delivery.balance().await {
					Ok(balance) => metrics.set_balance(balance.saturating_to::<u128>()),
					Err(e) => warn!(error = %e, "failed to read dispatcher balance"),
				}
			}
		}))
	}

	/// Processes one observed chain head: scan, reconcile, then schedule.
	///
	/// Heights may go down between calls. A dip is published as a reorg and
	/// only narrows what the scanner considers.
	#[instrument(skip(self))]
	pub async fn on_block(&self, height: u64) -> Result<BlockReport, AuctionError> {
		let previous = self
			.head
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.replace(height);
		let reorg = previous.is_some_and(|previous| height < previous);
		if reorg {
			warn!(height, previous = ?previous, "chain reorganized");
			self.publish(AuctionEvent::Chain(ChainEvent::Reorg {
				previous: previous.unwrap_or_default(),
				height,
			}));
		} else {
			self.publish(AuctionEvent::Chain(ChainEvent::BlockObserved { height }));
		}

		let scan = self.scanner.scan(height).await?;
		for intent in &scan.opened {
			if let IntentState::Ready { decrypted, unlock } = &intent.state {
				self.publish(AuctionEvent::Intent(IntentEvent::Ready {
					intent_id: intent.id.clone(),
					market: decrypted.market.clone(),
					unlock: *unlock,
				}));
			}
		}
		for intent in &scan.failed {
			if let IntentState::Failed { reason } = &intent.state {
				self.publish(AuctionEvent::Intent(IntentEvent::Failed {
					intent_id: intent.id.clone(),
					reason: reason.clone(),
				}));
			}
		}

		let reconcile = self.settlement.reconcile(height).await?;
		for report in &reconcile.finalized {
			publish_outcome(&self.event_bus, &report.key, &Ok(report.clone()));
		}
		for reverted in &reconcile.reverted {
			self.publish(AuctionEvent::Settlement(SettlementEvent::Reverted {
				key: reverted.key.clone(),
				tx_hash: reverted.tx_hash.clone(),
				reverted: reverted.reverted.len(),
			}));
		}
		for key in &reconcile.reopened {
			self.publish(AuctionEvent::Settlement(SettlementEvent::Failed {
				key: key.clone(),
				error: "settlement transaction reverted".to_string(),
			}));
		}
		for key in &reconcile.archived {
			self.publish(AuctionEvent::Batch(BatchEvent::Archived { key: key.clone() }));
		}

		let scheduled = if self.config.auction.auto_settle && !reorg {
			self.schedule(height).await?
		} else {
			Vec::new()
		};

		Ok(BlockReport {
			height,
			reorg,
			scan,
			reconcile,
			scheduled,
		})
	}

	/// Closes and dispatches every group whose epoch ended at least
	/// `settle_delay_blocks` before `height`.
	async fn schedule(&self, height: u64) -> Result<Vec<BatchKey>, AuctionError> {
		let epoch_size = self.config.auction.epoch_size;
		let delay = self.config.auction.settle_delay_blocks;
		let due = |key: &BatchKey| height >= epoch_end(key.epoch, epoch_size).saturating_add(delay);

		let mut keys: BTreeSet<BatchKey> = self
			.batch
			.pending_keys()
			.await?
			.into_iter()
			.filter(|key| due(key))
			.collect();
		// Batches whose earlier settlement failed.
		keys.extend(
			self.batches
				.list()
				.await?
				.into_iter()
				.filter(|batch| batch.status == BatchStatus::Closed && due(&batch.key))
				.map(|batch| batch.key),
		);

		let in_flight: HashSet<BatchKey> = self.settlement.in_flight().into_iter().collect();
		let mut scheduled = Vec::new();
		for key in keys {
			if in_flight.contains(&key) {
				continue;
			}
			match self.batches.get(&key).await? {
				// Late intents of an already settled group.
				Some(batch) if batch.status != BatchStatus::Closed => continue,
				Some(_) => {}
				None => match self.close_at(&key.market, key.epoch, height).await {
					Ok(_) => {}
					Err(AuctionError::Batch(e)) if e.is_empty_batch() => continue,
					Err(e) => {
						warn!(batch_id = %key, error = %e, "scheduled close failed");
						continue;
					}
				},
			}

			let settlement = self.settlement.clone();
			let events = self.event_bus.clone();
			let dispatched = key.clone();
			tokio::spawn(async move {
				let _ = dispatch(&settlement, &events, &dispatched).await;
			});
			scheduled.push(key);
		}

		if !scheduled.is_empty() {
			info!(height, batches = scheduled.len(), "scheduled settlements");
		}
		Ok(scheduled)
	}

	pub async fn current_block(&self) -> Result<u64, AuctionError> {
		Ok(self.source.current_block().await?)
	}

	/// Seals `decrypted` for `target_block`, records the submission on the
	/// ledger and stores the intent as `Pending`.
	///
	/// Nothing is stored when the target block is not in the future or the
	/// ledger submission fails.
	#[instrument(skip(self, decrypted), fields(market = %decrypted.market))]
	pub async fn submit_intent(
		&self,
		owner: &str,
		target_block: u64,
		decrypted: DecryptedIntent,
	) -> Result<Intent, AuctionError> {
		let owner = validate_owner(owner)?;
		decrypted.validate().map_err(AuctionError::InvalidInput)?;
		let current_block = self.current_block().await?;
		ensure_future(target_block, current_block)?;

		let payload = decrypted
			.to_payload()
			.map_err(|e| AuctionError::Service(format!("Failed to encode intent: {}", e)))?;
		let ciphertext = self
			.timelock
			.seal(&payload, target_block, current_block)
			.await?;

		let tx = submit_intent_transaction(
			self.contract,
			self.config.auction.chain_id,
			&ciphertext,
			target_block,
		);
		let tx_hash = self.delivery.deliver(tx).await?;

		self.record(&owner, target_block, ciphertext, current_block, Some(tx_hash))
			.await
	}

	/// Stores an intent that the client sealed and submitted itself.
	pub async fn submit_sealed(
		&self,
		owner: &str,
		target_block: u64,
		ciphertext: Ciphertext,
		submission_tx: Option<TransactionHash>,
	) -> Result<Intent, AuctionError> {
		let owner = validate_owner(owner)?;
		let current_block = self.current_block().await?;
		ensure_future(target_block, current_block)?;
		self.record(&owner, target_block, ciphertext, current_block, submission_tx)
			.await
	}

	async fn record(
		&self,
		owner: &str,
		target_block: u64,
		ciphertext: Ciphertext,
		current_block: u64,
		submission_tx: Option<TransactionHash>,
	) -> Result<Intent, AuctionError> {
		let intent = self
			.intents
			.create(owner, target_block, ciphertext, current_block, submission_tx)
			.await?;
		info!(intent_id = %intent.id, owner = %intent.owner, target_block, "intent submitted");
		self.publish(AuctionEvent::Intent(IntentEvent::Submitted {
			intent_id: intent.id.clone(),
			owner: intent.owner.clone(),
			target_block,
		}));
		Ok(intent)
	}

	pub async fn get_intent(&self, id: &str) -> Result<Intent, AuctionError> {
		Ok(self.intents.get(id).await?)
	}

	/// Intents of `owner`, or all intents. Newest submissions last.
	pub async fn list_intents(&self, owner: Option<&str>) -> Result<Vec<Intent>, AuctionError> {
		let mut intents = match owner {
			Some(owner) => self.intents.list_by_owner(owner).await?,
			None => self.intents.list().await?,
		};
		intents.sort_by(|a, b| {
			a.submitted_at
				.cmp(&b.submitted_at)
				.then_with(|| a.id.cmp(&b.id))
		});
		Ok(intents)
	}

	/// Operator action: closes the batch of `(market, epoch)` at the current
	/// block.
	pub async fn close_batch(
		&self,
		caller: Address,
		market: &str,
		epoch: u64,
	) -> Result<Batch, AuctionError> {
		self.authorize(caller, "close", market, epoch)?;
		let current_block = self.current_block().await?;
		self.close_at(market, epoch, current_block).await
	}

	fn authorize(
		&self,
		caller: Address,
		action: &str,
		market: &str,
		epoch: u64,
	) -> Result<(), AuctionError> {
		if !self.operators.contains(&caller) {
			warn!(%caller, action, market, epoch, "operator action requested by non-operator");
			return Err(AuctionError::Unauthorized(caller));
		}
		Ok(())
	}

	async fn close_at(&self, market: &str, epoch: u64, block: u64) -> Result<Batch, AuctionError> {
		if market.trim().is_empty() {
			return Err(AuctionError::InvalidInput("market must not be empty".into()));
		}
		let key = BatchKey::new(market, epoch);
		let existed = self.batches.get(&key).await?.is_some();
		let batch = self.batch.close_batch(market, epoch, block).await?;
		if !existed {
			self.publish(AuctionEvent::Batch(BatchEvent::Closed {
				key,
				clearing_price: batch.clearing_price,
				ai_price: batch.ai_price,
				intent_count: batch.intent_count(),
			}));
		}
		Ok(batch)
	}

	/// Operator action: closes the batch if needed and settles it.
	pub async fn settle(
		&self,
		caller: Address,
		market: &str,
		epoch: u64,
	) -> Result<SettlementReport, AuctionError> {
		let batch = self.close_batch(caller, market, epoch).await?;
		Ok(dispatch(&self.settlement, &self.event_bus, &batch.key).await?)
	}

	pub fn is_operator(&self, address: &Address) -> bool {
		self.operators.contains(address)
	}

	pub async fn list_batches(&self) -> Result<Vec<Batch>, AuctionError> {
		Ok(self.batches.list().await?)
	}

	pub async fn get_batch(&self, market: &str, epoch: u64) -> Result<Batch, AuctionError> {
		let key = BatchKey::new(market, epoch);
		self.batches
			.get(&key)
			.await?
			.ok_or_else(|| AuctionError::NotFound(format!("batch {}", key)))
	}

	/// Native balance of the settlement sender.
	pub async fn dispatcher_balance(&self) -> Result<alloy::primitives::U256, AuctionError> {
		Ok(self.delivery.balance().await?)
	}

	fn publish(&self, event: AuctionEvent) {
		self.event_bus.publish(event);
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	pub fn metrics(&self) -> &Arc<AuctionMetrics> {
		&self.metrics
	}

	pub fn config(&self) -> &Config {
		&self.config
	}
}

fn validate_owner(owner: &str) -> Result<String, AuctionError> {
	let owner = normalize_owner(owner);
	owner
		.parse::<Address>()
		.map_err(|e| AuctionError::InvalidInput(format!("owner '{}': {}", owner, e)))?;
	Ok(owner)
}

fn ensure_future(target_block: u64, current_block: u64) -> Result<(), AuctionError> {
	if target_block <= current_block {
		return Err(AuctionError::InvalidInput(format!(
			"target block {} must be greater than current block {}",
			target_block, current_block
		)));
	}
	Ok(())
}

async fn dispatch(
	settlement: &SettlementService,
	events: &EventBus,
	key: &BatchKey,
) -> Result<SettlementReport, SettlementError> {
	let result = settlement.settle(key).await;
	publish_outcome(events, key, &result);
	result
}

fn publish_outcome(
	events: &EventBus,
	key: &BatchKey,
	result: &Result<SettlementReport, SettlementError>,
) {
	match result {
		Ok(report) => {
			events.publish(AuctionEvent::Settlement(SettlementEvent::Confirmed {
				key: key.clone(),
				tx_hash: report.tx_hash.clone(),
				settlement_block: report.settlement_block,
				settled: report.settled.len(),
			}));
			if report.is_partial() {
				events.publish(AuctionEvent::Settlement(SettlementEvent::Partial {
					key: key.clone(),
					conflicts: report.conflicts.clone(),
				}));
			}
		}
		Err(SettlementError::AwaitingConfirmation { tx_hash, .. }) => {
			events.publish(AuctionEvent::Settlement(SettlementEvent::Submitted {
				key: key.clone(),
				tx_hash: tx_hash.clone(),
			}));
		}
		Err(e @ (SettlementError::AlreadyInFlight(_) | SettlementError::AlreadySettled { .. })) => {
			debug!(batch_id = %key, reason = %e, "settlement skipped");
		}
		Err(e) => {
			warn!(batch_id = %key, error = %e, "settlement failed");
			events.publish(AuctionEvent::Settlement(SettlementEvent::Failed {
				key: key.clone(),
				error: e.to_string(),
			}));
		}
	}
}

#[cfg(test)]
mod tests;
