//! Batch building for the sealed intent auction.
//!
//! Ready intents are grouped by market and epoch. Closing a group computes
//! its clearing price exactly once and persists the batch; every later close
//! of the same key returns the stored batch unchanged.

use async_trait::async_trait;
use auction_storage::{BatchStore, BatchStoreError, IntentStore, IntentStoreError};
use auction_types::{
	current_timestamp, Batch, BatchKey, BatchStatus, ConfigSchema, DecryptedIntent, IntentId,
	IntentStatus, PriceSource, Side,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

pub mod implementations {
	pub mod strategies {
		pub mod volume_match;
	}
	pub mod oracles {
		pub mod fixed;
		pub mod http;
	}
}

#[derive(Debug, Error)]
pub enum BatchError {
	#[error("No ready intents for {market} in epoch {epoch}")]
	EmptyBatch { market: String, epoch: u64 },
	#[error("Pricing failed: {0}")]
	Pricing(String),
	#[error("Price oracle error: {0}")]
	Oracle(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
	#[error(transparent)]
	Store(#[from] BatchStoreError),
	#[error(transparent)]
	Intents(#[from] IntentStoreError),
}

impl BatchError {
	/// An empty group is a no-op notice rather than a failure.
	pub fn is_empty_batch(&self) -> bool {
		matches!(self, BatchError::EmptyBatch { .. })
	}
}

/// Summed amount of every `side` intent.
///
/// Fails with [`BatchError::Pricing`] when the sum leaves the decimal range.
pub fn side_volume<'a>(
	intents: impl IntoIterator<Item = &'a DecryptedIntent>,
	side: Side,
) -> Result<Decimal, BatchError> {
	intents
		.into_iter()
		.filter(|intent| intent.side == side)
		.try_fold(Decimal::ZERO, |total, intent| total.checked_add(intent.amount))
		.ok_or_else(|| BatchError::Pricing(format!("{} volume overflows", side)))
}

/// Computes the clearing price of a batch.
#[async_trait]
pub trait PricingStrategy: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Derives one price for every member from the market's reference price.
	///
	/// `intents` is never empty.
	async fn clearing_price(
		&self,
		reference_price: Decimal,
		intents: &[DecryptedIntent],
	) -> Result<Decimal, BatchError>;
}

/// External price quote for a market.
#[async_trait]
pub trait PriceOracleInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	async fn quote(&self, key: &BatchKey) -> Result<Decimal, BatchError>;
}

/// Reference prices per market.
#[derive(Debug, Clone)]
pub struct PriceBook {
	default_price: Decimal,
	prices: HashMap<String, Decimal>,
}

impl PriceBook {
	pub fn new(default_price: Decimal, prices: HashMap<String, Decimal>) -> Self {
		Self {
			default_price,
			prices,
		}
	}

	pub fn reference(&self, market: &str) -> Decimal {
		self.prices
			.get(market)
			.copied()
			.unwrap_or(self.default_price)
	}
}

impl Default for PriceBook {
	fn default() -> Self {
		Self::new(Decimal::ONE, HashMap::new())
	}
}

/// Groups ready intents into batches and fixes their clearing price.
pub struct BatchService {
	intents: Arc<IntentStore>,
	batches: Arc<BatchStore>,
	strategy: Box<dyn PricingStrategy>,
	oracle: Option<Box<dyn PriceOracleInterface>>,
	price_source: PriceSource,
	prices: PriceBook,
	epoch_size: u64,
	closing: DashMap<BatchKey, Arc<OnceCell<Batch>>>,
}

impl BatchService {
	pub fn new(
		intents: Arc<IntentStore>,
		batches: Arc<BatchStore>,
		strategy: Box<dyn PricingStrategy>,
		prices: PriceBook,
		epoch_size: u64,
	) -> Self {
		Self {
			intents,
			batches,
			strategy,
			oracle: None,
			price_source: PriceSource::Strategy,
			prices,
			epoch_size,
			closing: DashMap::new(),
		}
	}

	/// Attaches a price oracle. With [`PriceSource::Oracle`] its quote
	/// becomes the clearing price, otherwise it is only recorded.
	pub fn with_oracle(
		mut self,
		oracle: Box<dyn PriceOracleInterface>,
		price_source: PriceSource,
	) -> Self {
		self.oracle = Some(oracle);
		self.price_source = price_source;
		self
	}

	pub fn epoch_size(&self) -> u64 {
		self.epoch_size
	}

	/// Closes the batch for `(market, epoch)`.
	///
	/// Returns the stored batch if the key was closed before. Concurrent
	/// closes of the same key share one computation.
	#[instrument(skip(self), fields(market = %market))]
	pub async fn close_batch(
		&self,
		market: &str,
		epoch: u64,
		current_block: u64,
	) -> Result<Batch, BatchError> {
		let key = BatchKey::new(market, epoch);
		if let Some(batch) = self.batches.get(&key).await? {
			return Ok(batch);
		}

		let cell = self
			.closing
			.entry(key.clone())
			.or_insert_with(|| Arc::new(OnceCell::new()))
			.clone();
		let result = cell
			.get_or_try_init(|| self.build(&key, current_block))
			.await
			.cloned();
		self.closing
			.remove_if(&key, |_, existing| Arc::ptr_eq(existing, &cell));
		result
	}

	async fn build(&self, key: &BatchKey, current_block: u64) -> Result<Batch, BatchError> {
		// A close that finished between the caller's lookup and claiming the
		// cell has already stored the batch.
		if let Some(batch) = self.batches.get(key).await? {
			return Ok(batch);
		}

		let mut members: Vec<(IntentId, DecryptedIntent)> = self
			.intents
			.list_by_status(IntentStatus::Ready)
			.await?
			.into_iter()
			.filter(|intent| intent.batch_key(self.epoch_size).as_ref() == Some(key))
			.filter_map(|intent| {
				let decrypted = intent.state.decrypted()?.clone();
				Some((intent.id, decrypted))
			})
			.collect();
		if members.is_empty() {
			return Err(BatchError::EmptyBatch {
				market: key.market.clone(),
				epoch: key.epoch,
			});
		}
		members.sort_by(|a, b| a.0.cmp(&b.0));

		let decrypted: Vec<DecryptedIntent> =
			members.iter().map(|(_, intent)| intent.clone()).collect();
		let buy_volume = side_volume(&decrypted, Side::Buy)?;
		let sell_volume = side_volume(&decrypted, Side::Sell)?;
		let strategy_price = self
			.strategy
			.clearing_price(self.prices.reference(&key.market), &decrypted)
			.await?;

		let ai_price = match &self.oracle {
			Some(oracle) => match oracle.quote(key).await {
				Ok(price) => Some(price),
				Err(e) if self.price_source == PriceSource::Oracle => return Err(e),
				Err(e) => {
					warn!(
						batch_id = %key,
						error = %e,
						"price oracle unavailable, closing without quote"
					);
					None
				}
			},
			None => None,
		};

		let (clearing_price, price_source) = match (self.price_source, ai_price) {
			(PriceSource::Oracle, Some(price)) => (price, PriceSource::Oracle),
			_ => (strategy_price, PriceSource::Strategy),
		};

		let batch = Batch {
			key: key.clone(),
			members: members.into_iter().map(|(id, _)| id).collect(),
			buy_volume,
			sell_volume,
			clearing_price,
			ai_price,
			price_source,
			closed_at: current_timestamp(),
			closed_at_block: current_block,
			status: BatchStatus::Closed,
		};

		let stored = self.batches.insert_if_absent(batch).await?;
		info!(
			batch_id = %stored.id(),
			intents = stored.intent_count(),
			clearing_price = %stored.clearing_price,
			ai_price = ?stored.ai_price,
			"batch closed"
		);
		Ok(stored)
	}

	/// Keys of every group that currently holds ready intents.
	pub async fn pending_keys(&self) -> Result<Vec<BatchKey>, BatchError> {
		let keys: BTreeSet<BatchKey> = self
			.intents
			.list_by_status(IntentStatus::Ready)
			.await?
			.iter()
			.filter_map(|intent| intent.batch_key(self.epoch_size))
			.collect();
		Ok(keys.into_iter().collect())
	}
}


#[cfg(test)]
mod tests {
	use super::test_support::*;
	use super::*;
	use crate::implementations::oracles::fixed::FixedPriceOracle;
	use crate::implementations::strategies::volume_match::VolumeMatch;
	use std::str::FromStr;

	fn service(intents: Arc<IntentStore>, batches: Arc<BatchStore>) -> BatchService {
		let prices = PriceBook::new(
			Decimal::ONE,
			HashMap::from([("ETH/USDC".to_string(), Decimal::from(2000))]),
		);
		BatchService::new(intents, batches, Box::new(VolumeMatch::default()), prices, 100)
	}

	#[tokio::test]
	async fn test_close_collects_matching_group_only() {
		let (intents, batches) = stores();
		let member = ready(&intents, 100, order("ETH/USDC", Side::Buy, "1.0", 50)).await;
		ready(&intents, 250, order("ETH/USDC", Side::Buy, "1.0", 50)).await;
		ready(&intents, 150, order("BTC/USDC", Side::Sell, "2.0", 50)).await;

		let batch = service(intents, batches)
			.close_batch("ETH/USDC", 1, 160)
			.await
			.unwrap();
		assert_eq!(batch.members, vec![member.id]);
		assert_eq!(batch.buy_volume, Decimal::ONE);
		assert_eq!(batch.sell_volume, Decimal::ZERO);
		assert_eq!(batch.closed_at_block, 160);
		assert_eq!(batch.status, BatchStatus::Closed);
	}

	#[tokio::test]
	async fn test_close_is_idempotent() {
		let (intents, batches) = stores();
		ready(&intents, 120, order("ETH/USDC", Side::Buy, "3", 50)).await;
		ready(&intents, 130, order("ETH/USDC", Side::Sell, "1", 80)).await;
		let service = service(intents.clone(), batches);

		let first = service.close_batch("ETH/USDC", 1, 200).await.unwrap();
		// A late intent does not change a closed batch.
		ready(&intents, 140, order("ETH/USDC", Side::Buy, "5", 50)).await;
		let second = service.close_batch("ETH/USDC", 1, 210).await.unwrap();

		assert_eq!(first, second);
		assert_eq!(first.clearing_price, Decimal::from_str("2005").unwrap());
	}

	#[tokio::test]
	async fn test_concurrent_closes_share_one_price() {
		let (intents, batches) = stores();
		for i in 0..4 {
			let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
			ready(&intents, 100 + i, order("ETH/USDC", side, "1.5", 25)).await;
		}
		let service = Arc::new(service(intents, batches));

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let service = service.clone();
				tokio::spawn(async move { service.close_batch("ETH/USDC", 1, 200).await })
			})
			.collect();

		let mut results = Vec::new();
		for handle in handles {
			results.push(handle.await.unwrap().unwrap());
		}
		assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
		assert_eq!(results[0].intent_count(), 4);
	}

	#[tokio::test]
	async fn test_volume_overflow_fails_the_close() {
		let (intents, batches) = stores();
		let huge = "50000000000000000000000000000";
		ready(&intents, 100, order("ETH/USDC", Side::Buy, huge, 50)).await;
		ready(&intents, 110, order("ETH/USDC", Side::Buy, huge, 50)).await;

		let result = service(intents, batches.clone())
			.close_batch("ETH/USDC", 1, 150)
			.await;
		assert!(matches!(result, Err(BatchError::Pricing(_))));
		assert!(batches.get(&BatchKey::new("ETH/USDC", 1)).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_empty_group_is_reported() {
		let (intents, batches) = stores();
		let err = service(intents, batches)
			.close_batch("ETH/USDC", 7, 900)
			.await
			.unwrap_err();
		assert!(err.is_empty_batch());
	}

	#[tokio::test]
	async fn test_oracle_quote_is_audit_only_by_default() {
		let (intents, batches) = stores();
		ready(&intents, 100, order("ETH/USDC", Side::Buy, "1", 50)).await;
		let oracle = FixedPriceOracle::new(HashMap::from([(
			"ETH/USDC".to_string(),
			Decimal::from(1990),
		)]));
		let service = service(intents, batches)
			.with_oracle(Box::new(oracle), PriceSource::Strategy);

		let batch = service.close_batch("ETH/USDC", 1, 150).await.unwrap();
		assert_eq!(batch.ai_price, Some(Decimal::from(1990)));
		assert_eq!(batch.price_source, PriceSource::Strategy);
		assert_eq!(batch.clearing_price, Decimal::from_str("2010").unwrap());
	}

	#[tokio::test]
	async fn test_oracle_as_price_source() {
		let (intents, batches) = stores();
		ready(&intents, 100, order("ETH/USDC", Side::Buy, "1", 50)).await;
		ready(&intents, 110, order("BTC/USDC", Side::Buy, "1", 50)).await;
		let oracle = FixedPriceOracle::new(HashMap::from([(
			"ETH/USDC".to_string(),
			Decimal::from(1990),
		)]));
		let service = service(intents, batches)
			.with_oracle(Box::new(oracle), PriceSource::Oracle);

		let batch = service.close_batch("ETH/USDC", 1, 150).await.unwrap();
		assert_eq!(batch.clearing_price, Decimal::from(1990));
		assert_eq!(batch.price_source, PriceSource::Oracle);

		// Without a quote the batch cannot be priced and stays open.
		assert!(matches!(
			service.close_batch("BTC/USDC", 1, 150).await,
			Err(BatchError::Oracle(_))
		));
	}

	#[tokio::test]
	async fn test_pending_keys() {
		let (intents, batches) = stores();
		ready(&intents, 310, order("ETH/USDC", Side::Buy, "1", 50)).await;
		ready(&intents, 120, order("ETH/USDC", Side::Buy, "1", 50)).await;
		ready(&intents, 130, order("ETH/USDC", Side::Sell, "1", 50)).await;

		let keys = service(intents, batches).pending_keys().await.unwrap();
		assert_eq!(
			keys,
			vec![BatchKey::new("ETH/USDC", 1), BatchKey::new("ETH/USDC", 3)]
		);
	}
}
