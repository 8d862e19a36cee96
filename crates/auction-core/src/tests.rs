use super::*;
use auction_batch::implementations::strategies::volume_match;
use auction_config::ConfigLoader;
use auction_delivery::implementations::local::{LocalLedger, LocalLedgerHandle};
use auction_scanner::implementations::manual::{ManualBlockHandle, ManualBlockSource};
use auction_storage::implementations::memory;
use auction_timelock::implementations::local::{self, LocalTimelock};
use auction_timelock::TimelockInterface;
use auction_types::{epoch_of, IntentStatus, Side};
use std::str::FromStr;

const OPERATOR: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
const OWNER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

struct Harness {
	engine: AuctionEngine,
	blocks: ManualBlockHandle,
	ledger: LocalLedgerHandle,
}

fn harness(auto_settle: bool) -> Harness {
	let config = ConfigLoader::new()
		.load_from_str(&format!(
			r#"
[auction]
id = "test"
epoch_size = 10
chain_id = 31337
contract = "0x5fbdb2315678afecb367f032d93f642f64180aa3"
operators = ["{OPERATOR}"]
auto_settle = {auto_settle}
settle_delay_blocks = 1
finality_depth = 5

[storage]
backend = "memory"

[timelock]
backend = "local"

[blocks]
source = "manual"

[delivery]
confirmations = 1
timeout_seconds = 2

[[delivery.providers]]
backend = "local"

[pricing.reference_prices]
"ETH/USDC" = "2000"
"#
		))
		.unwrap();

	let blocks = ManualBlockSource::new(90, None).handle();
	let ledger = LocalLedger::new(1_000).handle();
	let engine = AuctionBuilder::new(config)
		.with_storage_factory("memory", memory::create_storage)
		.with_timelock_factory("local", local::create_timelock)
		.with_block_source_factory("manual", {
			let blocks = blocks.clone();
			move |_| Ok(Box::new(blocks.source()))
		})
		.with_delivery_factory("local", {
			let ledger = ledger.clone();
			move |_| Ok(Box::new(ledger.ledger()))
		})
		.with_strategy_factory("volume_match", volume_match::create_strategy)
		.build()
		.unwrap();

	Harness {
		engine,
		blocks,
		ledger,
	}
}

fn order(side: Side, amount: &str) -> DecryptedIntent {
	DecryptedIntent {
		market: "ETH/USDC".to_string(),
		side,
		amount: Decimal::from_str(amount).unwrap(),
		slippage_bps: 50,
	}
}

fn operator() -> Address {
	OPERATOR.parse().unwrap()
}

async fn advance_to(harness: &Harness, height: u64) -> BlockReport {
	harness.blocks.set(height);
	harness.engine.on_block(height).await.unwrap()
}

#[tokio::test]
async fn test_intent_lifecycle_end_to_end() {
	let h = harness(false);
	let intent = h
		.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "1.0"))
		.await
		.unwrap();
	assert_eq!(intent.status(), IntentStatus::Pending);
	assert_eq!(intent.owner, OWNER.to_ascii_lowercase());
	assert!(intent.submission_tx.is_some());

	let report = advance_to(&h, 99).await;
	assert_eq!(report.scan.considered, 0);

	let report = advance_to(&h, 100).await;
	assert_eq!(report.scan.opened.len(), 1);
	let ready = h.engine.get_intent(&intent.id).await.unwrap();
	assert_eq!(ready.status(), IntentStatus::Ready);
	assert_eq!(ready.state.decrypted().unwrap().market, "ETH/USDC");

	let batch = h
		.engine
		.close_batch(operator(), "ETH/USDC", epoch_of(100, 10))
		.await
		.unwrap();
	assert_eq!(batch.members, vec![intent.id.clone()]);

	let settled = h
		.engine
		.settle(operator(), "ETH/USDC", epoch_of(100, 10))
		.await
		.unwrap();
	assert_eq!(settled.settled, vec![intent.id.clone()]);

	let intent = h.engine.get_intent(&intent.id).await.unwrap();
	assert_eq!(intent.status(), IntentStatus::Settled);
	assert_eq!(intent.state.inclusion_block(), Some(settled.settlement_block));
	assert_eq!(intent.state.settlement_price(), Some(batch.clearing_price));
}

#[tokio::test]
async fn test_target_block_must_be_in_the_future() {
	let h = harness(false);
	for target in [80, 90] {
		assert!(matches!(
			h.engine
				.submit_intent(OWNER, target, order(Side::Buy, "1"))
				.await,
			Err(AuctionError::InvalidInput(_))
		));
	}
	assert!(h.engine.list_intents(None).await.unwrap().is_empty());
	assert_eq!(h.ledger.transaction_count(), 0);
}

#[tokio::test]
async fn test_rejects_malformed_submissions() {
	let h = harness(false);
	assert!(matches!(
		h.engine
			.submit_intent("not-an-address", 100, order(Side::Buy, "1"))
			.await,
		Err(AuctionError::InvalidInput(_))
	));
	assert!(matches!(
		h.engine
			.submit_intent(OWNER, 100, order(Side::Sell, "0"))
			.await,
		Err(AuctionError::InvalidInput(_))
	));
}

#[tokio::test]
async fn test_client_sealed_intent_is_opened() {
	let h = harness(false);
	let payload = order(Side::Sell, "2").to_payload().unwrap();
	let ciphertext = LocalTimelock::new("auction-local-timelock", true, 0)
		.seal(&payload, 95)
		.await
		.unwrap();

	let intent = h
		.engine
		.submit_sealed(OWNER, 95, ciphertext, None)
		.await
		.unwrap();
	assert!(intent.submission_tx.is_none());

	advance_to(&h, 95).await;
	let opened = h.engine.get_intent(&intent.id).await.unwrap();
	assert_eq!(opened.state.decrypted().unwrap().side, Side::Sell);

	let listed = h.engine.list_intents(Some(OWNER)).await.unwrap();
	assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_chain_dip_does_not_regress_ready_intents() {
	let h = harness(false);
	let mut events = h.engine.event_bus().subscribe();
	let intent = h
		.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "1"))
		.await
		.unwrap();

	advance_to(&h, 100).await;
	let report = advance_to(&h, 98).await;
	assert!(report.reorg);
	assert_eq!(
		h.engine.get_intent(&intent.id).await.unwrap().status(),
		IntentStatus::Ready
	);

	let mut saw_reorg = false;
	while let Ok(event) = events.try_recv() {
		if let AuctionEvent::Chain(ChainEvent::Reorg { previous, height }) = event {
			assert_eq!((previous, height), (100, 98));
			saw_reorg = true;
		}
	}
	assert!(saw_reorg);
}

#[tokio::test]
async fn test_only_operators_settle() {
	let h = harness(false);
	h.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "1"))
		.await
		.unwrap();
	advance_to(&h, 100).await;

	let stranger: Address = OWNER.parse().unwrap();
	assert!(matches!(
		h.engine.settle(stranger, "ETH/USDC", 10).await,
		Err(AuctionError::Unauthorized(_))
	));
	assert!(h.engine.list_batches().await.unwrap().is_empty());
	assert!(h.engine.is_operator(&operator()));
}

#[tokio::test]
async fn test_strangers_cannot_close_a_batch_early() {
	let h = harness(false);
	let early = h
		.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "1"))
		.await
		.unwrap();
	let late = h
		.engine
		.submit_intent(OWNER, 105, order(Side::Sell, "1"))
		.await
		.unwrap();
	advance_to(&h, 100).await;

	let stranger: Address = OWNER.parse().unwrap();
	assert!(matches!(
		h.engine.close_batch(stranger, "ETH/USDC", 10).await,
		Err(AuctionError::Unauthorized(_))
	));
	assert!(h.engine.list_batches().await.unwrap().is_empty());

	advance_to(&h, 105).await;
	let batch = h
		.engine
		.close_batch(operator(), "ETH/USDC", 10)
		.await
		.unwrap();
	let mut members = batch.members.clone();
	members.sort();
	let mut expected = vec![early.id, late.id];
	expected.sort();
	assert_eq!(members, expected);
}

#[tokio::test]
async fn test_settling_an_empty_group_is_reported() {
	let h = harness(false);
	let err = h.engine.settle(operator(), "ETH/USDC", 3).await.unwrap_err();
	assert!(matches!(err, AuctionError::Batch(ref e) if e.is_empty_batch()));
}

#[tokio::test]
async fn test_reorged_settlement_is_reopened_and_settles_again() {
	let h = harness(false);
	let intent = h
		.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "1"))
		.await
		.unwrap();
	advance_to(&h, 100).await;
	let first = h.engine.settle(operator(), "ETH/USDC", 10).await.unwrap();

	assert!(h.ledger.drop_transaction(&first.tx_hash));
	let report = advance_to(&h, 101).await;
	assert_eq!(report.reconcile.reverted.len(), 1);
	assert_eq!(
		h.engine.get_intent(&intent.id).await.unwrap().status(),
		IntentStatus::Ready
	);
	let batch = h.engine.get_batch("ETH/USDC", 10).await.unwrap();
	assert_eq!(batch.status, BatchStatus::Closed);

	let second = h.engine.settle(operator(), "ETH/USDC", 10).await.unwrap();
	assert_ne!(second.tx_hash, first.tx_hash);
	assert_eq!(second.clearing_price, first.clearing_price);
}

#[tokio::test]
async fn test_scheduler_settles_finished_epochs() {
	let h = harness(true);
	let buy = h
		.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "3"))
		.await
		.unwrap();
	let sell = h
		.engine
		.submit_intent(OWNER, 105, order(Side::Sell, "1"))
		.await
		.unwrap();

	let report = advance_to(&h, 106).await;
	assert_eq!(report.scan.opened.len(), 2);
	// Epoch 10 ends at block 110, plus one block of delay.
	assert!(report.scheduled.is_empty());
	assert!(advance_to(&h, 110).await.scheduled.is_empty());

	let report = advance_to(&h, 111).await;
	assert_eq!(report.scheduled, vec![BatchKey::new("ETH/USDC", 10)]);

	let mut settled = false;
	for _ in 0..200 {
		let statuses = [
			h.engine.get_intent(&buy.id).await.unwrap().status(),
			h.engine.get_intent(&sell.id).await.unwrap().status(),
		];
		if statuses == [IntentStatus::Settled; 2] {
			settled = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(settled);

	let summary = BatchSummary::from(&h.engine.get_batch("ETH/USDC", 10).await.unwrap());
	assert_eq!(summary.intent_count, 2);
	assert_eq!(summary.status, "settled");
	// Buy pressure 3 vs 1 at 50 bps moves the price up by 0.25%.
	assert_eq!(summary.clearing_price, Decimal::from(2005));

	// A settled group is not scheduled again.
	assert!(advance_to(&h, 112).await.scheduled.is_empty());
}

#[tokio::test]
async fn test_metrics_follow_events() {
	let h = harness(false);
	let sink = spawn_event_sink(h.engine.event_bus(), h.engine.metrics().clone());
	h.engine
		.submit_intent(OWNER, 100, order(Side::Buy, "1"))
		.await
		.unwrap();
	advance_to(&h, 100).await;
	h.engine.settle(operator(), "ETH/USDC", 10).await.unwrap();

	let mut snapshot = h.engine.metrics().snapshot();
	for _ in 0..100 {
		if snapshot.settlements == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
		snapshot = h.engine.metrics().snapshot();
	}
	assert_eq!(snapshot.intents_submitted, 1);
	assert_eq!(snapshot.intents_ready, 1);
	assert_eq!(snapshot.batches_closed, 1);
	assert_eq!(snapshot.settlements, 1);
	assert_eq!(snapshot.chain_head, 100);
	sink.abort();
}
