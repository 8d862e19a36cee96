//! Auction metrics.
//!
//! Counters and gauges are plain atomics updated from [`AuctionEvent`]s and
//! the balance poller. [`AuctionMetrics::render`] produces the Prometheus
//! text exposition format.

use auction_types::{
	AuctionEvent, BatchEvent, ChainEvent, EventBus, IntentEvent, SettlementEvent,
};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct AuctionMetrics {
	settlements: AtomicU64,
	settlement_failures: AtomicU64,
	settlements_reverted: AtomicU64,
	intents_submitted: AtomicU64,
	intents_ready: AtomicU64,
	intents_failed: AtomicU64,
	batches_closed: AtomicU64,
	reorgs: AtomicU64,
	chain_head: AtomicU64,
	// Wei balances exceed u64.
	balance_wei: Mutex<Option<u128>>,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
	pub settlements: u64,
	pub settlement_failures: u64,
	pub settlements_reverted: u64,
	pub intents_submitted: u64,
	pub intents_ready: u64,
	pub intents_failed: u64,
	pub batches_closed: u64,
	pub reorgs: u64,
	pub chain_head: u64,
	pub balance_wei: Option<u128>,
}

impl AuctionMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	/// Updates the metrics affected by `event`.
	pub fn observe(&self, event: &AuctionEvent) {
		let counter = match event {
			AuctionEvent::Intent(IntentEvent::Submitted { .. }) => &self.intents_submitted,
			AuctionEvent::Intent(IntentEvent::Ready { .. }) => &self.intents_ready,
			AuctionEvent::Intent(IntentEvent::Failed { .. }) => &self.intents_failed,
			AuctionEvent::Batch(BatchEvent::Closed { .. }) => &self.batches_closed,
			AuctionEvent::Settlement(SettlementEvent::Confirmed { .. }) => &self.settlements,
			AuctionEvent::Settlement(SettlementEvent::Failed { .. }) => &self.settlement_failures,
			AuctionEvent::Settlement(SettlementEvent::Reverted { .. }) => {
				&self.settlements_reverted
			}
			AuctionEvent::Chain(ChainEvent::BlockObserved { height }) => {
				self.chain_head.store(*height, Ordering::Relaxed);
				return;
			}
			AuctionEvent::Chain(ChainEvent::Reorg { height, .. }) => {
				self.chain_head.store(*height, Ordering::Relaxed);
				&self.reorgs
			}
			AuctionEvent::Batch(BatchEvent::Archived { .. })
			| AuctionEvent::Settlement(SettlementEvent::Submitted { .. })
			| AuctionEvent::Settlement(SettlementEvent::Partial { .. }) => return,
		};
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn set_balance(&self, balance_wei: u128) {
		*self
			.balance_wei
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(balance_wei);
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			settlements: self.settlements.load(Ordering::Relaxed),
			settlement_failures: self.settlement_failures.load(Ordering::Relaxed),
			settlements_reverted: self.settlements_reverted.load(Ordering::Relaxed),
			intents_submitted: self.intents_submitted.load(Ordering::Relaxed),
			intents_ready: self.intents_ready.load(Ordering::Relaxed),
			intents_failed: self.intents_failed.load(Ordering::Relaxed),
			batches_closed: self.batches_closed.load(Ordering::Relaxed),
			reorgs: self.reorgs.load(Ordering::Relaxed),
			chain_head: self.chain_head.load(Ordering::Relaxed),
			balance_wei: *self
				.balance_wei
				.lock()
				.unwrap_or_else(|poisoned| poisoned.into_inner()),
		}
	}

	/// Renders all metrics in the Prometheus text format.
	pub fn render(&self) -> String {
		let snapshot = self.snapshot();
		let counters = [
			(
				"auction_settlements_total",
				"Confirmed batch settlements.",
				snapshot.settlements,
			),
			(
				"auction_settlement_failures_total",
				"Settlement attempts that failed or reverted.",
				snapshot.settlement_failures,
			),
			(
				"auction_settlements_reverted_total",
				"Confirmed settlements later removed by a reorg.",
				snapshot.settlements_reverted,
			),
			(
				"auction_intents_submitted_total",
				"Sealed intents accepted.",
				snapshot.intents_submitted,
			),
			(
				"auction_intents_ready_total",
				"Intents opened after their target block.",
				snapshot.intents_ready,
			),
			(
				"auction_intents_failed_total",
				"Intents that failed permanently.",
				snapshot.intents_failed,
			),
			(
				"auction_batches_closed_total",
				"Batches closed with a clearing price.",
				snapshot.batches_closed,
			),
			(
				"auction_reorgs_observed_total",
				"Observed drops of the chain head.",
				snapshot.reorgs,
			),
		];

		let mut out = String::new();
		for (name, help, value) in counters {
			let _ = writeln!(out, "# HELP {} {}", name, help);
			let _ = writeln!(out, "# TYPE {} counter", name);
			let _ = writeln!(out, "{} {}", name, value);
		}

		let _ = writeln!(out, "# HELP auction_chain_head Last observed block height.");
		let _ = writeln!(out, "# TYPE auction_chain_head gauge");
		let _ = writeln!(out, "auction_chain_head {}", snapshot.chain_head);
		if let Some(balance) = snapshot.balance_wei {
			let _ = writeln!(
				out,
				"# HELP auction_dispatcher_balance_wei Native balance of the settlement sender."
			);
			let _ = writeln!(out, "# TYPE auction_dispatcher_balance_wei gauge");
			let _ = writeln!(out, "auction_dispatcher_balance_wei {}", balance);
		}
		out
	}
}

/// Feeds every event published on `bus` into `metrics` until the bus closes.
pub fn spawn_event_sink(bus: &EventBus, metrics: Arc<AuctionMetrics>) -> JoinHandle<()> {
	let mut receiver = bus.subscribe();
	tokio::spawn(async move {
		loop {
			match receiver.recv().await {
				Ok(event) => metrics.observe(&event),
				Err(RecvError::Lagged(skipped)) => {
					warn!(skipped, "metrics sink lagged behind the event bus");
				}
				Err(RecvError::Closed) => {
					debug!("event bus closed, stopping metrics sink");
					break;
				}
			}
		}
	})
}
