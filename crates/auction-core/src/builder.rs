//! Assembles an [`AuctionEngine`] from configuration and registered factories.

use crate::{AuctionEngine, AuctionError};
use alloy::primitives::Address;
use auction_batch::{
	BatchError, BatchService, PriceBook, PriceOracleInterface, PricingStrategy,
};
use auction_config::{Config, PriceSourceSetting};
use auction_delivery::{DeliveryError, DeliveryInterface, DeliveryService};
use auction_monitoring::AuctionMetrics;
use auction_scanner::{BlockMonitor, BlockSourceInterface, EligibilityScanner, ScannerError};
use auction_settlement::SettlementService;
use auction_storage::{BatchStore, IntentStore, StorageError, StorageInterface, StorageService};
use auction_timelock::{TimelockError, TimelockInterface, TimelockService};
use auction_types::{EventBus, PriceSource};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

// Type aliases for factory functions
type StorageFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> + Send>;
type TimelockFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn TimelockInterface>, TimelockError> + Send>;
type BlockSourceFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn BlockSourceInterface>, ScannerError> + Send>;
type DeliveryFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn DeliveryInterface>, DeliveryError> + Send>;
type StrategyFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn PricingStrategy>, BatchError> + Send>;
type OracleFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn PriceOracleInterface>, BatchError> + Send>;

const EVENT_BUS_CAPACITY: usize = 1000;

/// Factory pattern for creating services from config.
///
/// Every pluggable component is looked up by the backend name given in the
/// configuration. Factories validate their own `config` table.
pub struct AuctionBuilder {
	config: Config,
	storage_factories: HashMap<String, StorageFactory>,
	timelock_factories: HashMap<String, TimelockFactory>,
	block_source_factories: HashMap<String, BlockSourceFactory>,
	delivery_factories: HashMap<String, DeliveryFactory>,
	strategy_factories: HashMap<String, StrategyFactory>,
	oracle_factories: HashMap<String, OracleFactory>,
}

impl AuctionBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			storage_factories: HashMap::new(),
			timelock_factories: HashMap::new(),
			block_source_factories: HashMap::new(),
			delivery_factories: HashMap::new(),
			strategy_factories: HashMap::new(),
			oracle_factories: HashMap::new(),
		}
	}

	pub fn with_storage_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> + Send + 'static,
	{
		self.storage_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_timelock_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn TimelockInterface>, TimelockError> + Send + 'static,
	{
		self.timelock_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_block_source_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn BlockSourceInterface>, ScannerError> + Send + 'static,
	{
		self.block_source_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_delivery_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn DeliveryInterface>, DeliveryError> + Send + 'static,
	{
		self.delivery_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_strategy_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn PricingStrategy>, BatchError> + Send + 'static,
	{
		self.strategy_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_oracle_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn PriceOracleInterface>, BatchError> + Send + 'static,
	{
		self.oracle_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn build(self) -> Result<AuctionEngine, AuctionError> {
		let config = self.config;
		let settings = &config.auction;

		// Storage
		let storage_backend = lookup(&self.storage_factories, "storage", &config.storage.backend)?(
			&config.storage.config,
		)
		.map_err(|e| AuctionError::Config(format!("storage: {}", e)))?;
		let storage = Arc::new(StorageService::new(storage_backend));
		let intents = Arc::new(IntentStore::new(storage.clone()));
		let batches = Arc::new(BatchStore::new(storage));

		// Time-lock oracle
		let oracle = lookup(&self.timelock_factories, "timelock", &config.timelock.backend)?(
			&config.timelock.config,
		)
		.map_err(|e| AuctionError::Config(format!("timelock: {}", e)))?;
		let timelock = Arc::new(TimelockService::new(
			oracle,
			Duration::from_millis(config.timelock.timeout_ms),
			config.timelock.max_retries,
		));

		// Block source
		let source: Arc<dyn BlockSourceInterface> = Arc::from(
			lookup(&self.block_source_factories, "block source", &config.blocks.source)?(
				&config.blocks.config,
			)
			.map_err(|e| AuctionError::Config(format!("blocks: {}", e)))?,
		);
		let monitor = BlockMonitor::new(
			source.clone(),
			Duration::from_millis(config.blocks.poll_interval_ms),
		);

		// Delivery providers, in fallback order
		let mut providers = Vec::new();
		for provider in &config.delivery.providers {
			let factory = lookup(&self.delivery_factories, "delivery", &provider.backend)?;
			providers.push(
				factory(&provider.config)
					.map_err(|e| AuctionError::Config(format!("delivery: {}", e)))?,
			);
		}
		if providers.is_empty() {
			return Err(AuctionError::Config(
				"No delivery providers configured".into(),
			));
		}
		let delivery = Arc::new(DeliveryService::new(
			providers,
			config.delivery.confirmations,
			Duration::from_secs(config.delivery.timeout_seconds),
		));

		// Pricing
		let create_strategy = lookup(
			&self.strategy_factories,
			"pricing strategy",
			&config.pricing.strategy,
		)?;
		let strategy = create_strategy(&toml::Value::Table(toml::Table::new()))
			.map_err(|e| AuctionError::Config(format!("pricing: {}", e)))?;
		let prices = PriceBook::new(
			config.pricing.default_reference_price,
			config.pricing.reference_prices.clone(),
		);
		let mut batch = BatchService::new(
			intents.clone(),
			batches.clone(),
			strategy,
			prices,
			settings.epoch_size,
		);
		if let Some(oracle_config) = &config.pricing.oracle {
			let oracle = lookup(&self.oracle_factories, "price oracle", &oracle_config.backend)?(
				&oracle_config.config,
			)
			.map_err(|e| AuctionError::Config(format!("price oracle: {}", e)))?;
			let price_source = match config.pricing.price_source {
				PriceSourceSetting::Strategy => PriceSource::Strategy,
				PriceSourceSetting::Oracle => PriceSource::Oracle,
			};
			batch = batch.with_oracle(oracle, price_source);
		}

		// Settlement
		let contract = parse_address("auction.contract", &settings.contract)?;
		let operators = settings
			.operators
			.iter()
			.map(|operator| parse_address("auction.operators", operator))
			.collect::<Result<HashSet<_>, _>>()?;
		let settlement = Arc::new(SettlementService::new(
			intents.clone(),
			batches.clone(),
			delivery.clone(),
			contract,
			settings.chain_id,
			settings.finality_depth,
		));

		let scanner = EligibilityScanner::new(
			intents.clone(),
			timelock.clone(),
			settings.max_open_attempts,
			settings.scan_concurrency,
		);

		info!(
			auction_id = %settings.id,
			epoch_size = settings.epoch_size,
			operators = operators.len(),
			auto_settle = settings.auto_settle,
			"auction engine built"
		);

		Ok(AuctionEngine {
			intents,
			batches,
			timelock,
			scanner,
			batch: Arc::new(batch),
			delivery,
			settlement,
			source,
			monitor,
			operators,
			contract,
			event_bus: EventBus::new(EVENT_BUS_CAPACITY),
			metrics: Arc::new(AuctionMetrics::new()),
			head: Mutex::new(None),
			config,
		})
	}
}

fn lookup<'a, F>(
	factories: &'a HashMap<String, F>,
	component: &str,
	name: &str,
) -> Result<&'a F, AuctionError> {
	factories.get(name).ok_or_else(|| {
		AuctionError::Config(format!("Unknown {} backend: {}", component, name))
	})
}

fn parse_address(field: &str, value: &str) -> Result<Address, AuctionError> {
	value
		.parse()
		.map_err(|e| AuctionError::Config(format!("{} '{}': {}", field, value, e)))
}
