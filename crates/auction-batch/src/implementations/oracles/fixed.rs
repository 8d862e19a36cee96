//! Price oracle answering from a configured table.

use crate::{BatchError, PriceOracleInterface};
use async_trait::async_trait;
use auction_types::{BatchKey, ConfigSchema, Field, FieldType, Schema, ValidationError};
use rust_decimal::Decimal;
use std::collections::HashMap;

pub struct FixedPriceOracle {
	prices: HashMap<String, Decimal>,
}

impl FixedPriceOracle {
	pub fn new(prices: HashMap<String, Decimal>) -> Self {
		Self { prices }
	}
}

#[async_trait]
impl PriceOracleInterface for FixedPriceOracle {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FixedPriceOracleSchema)
	}

	async fn quote(&self, key: &BatchKey) -> Result<Decimal, BatchError> {
		self.prices
			.get(&key.market)
			.copied()
			.ok_or_else(|| BatchError::Oracle(format!("no quote for {}", key.market)))
	}
}

fn decimal_entries(value: &toml::Value) -> Result<(), String> {
	let table = value.as_table().ok_or("expected a table")?;
	for (market, price) in table {
		let text = price
			.as_str()
			.ok_or_else(|| format!("price of {} must be a decimal string", market))?;
		let price = auction_types::decimal(text)?;
		if price <= Decimal::ZERO {
			return Err(format!("price of {} must be positive", market));
		}
	}
	Ok(())
}

pub struct FixedPriceOracleSchema;

impl ConfigSchema for FixedPriceOracleSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("prices", FieldType::Table(Schema::empty()))
				.with_validator(decimal_entries)],
			vec![],
		)
		.validate(config)
	}
}

/// Creates a fixed price oracle.
///
/// Configuration parameters:
/// - `prices`: table of market to decimal string, e.g. `"ETH/USDC" = "1990.5"`
pub fn create_oracle(config: &toml::Value) -> Result<Box<dyn PriceOracleInterface>, BatchError> {
	FixedPriceOracleSchema
		.validate(config)
		.map_err(|e| BatchError::Configuration(e.to_string()))?;

	let mut prices = HashMap::new();
	if let Some(table) = config.get("prices").and_then(|v| v.as_table()) {
		for (market, price) in table {
			let text = price.as_str().unwrap_or_default();
			let price = auction_types::decimal(text).map_err(BatchError::Configuration)?;
			prices.insert(market.clone(), price);
		}
	}

	Ok(Box::new(FixedPriceOracle::new(prices)))
}
