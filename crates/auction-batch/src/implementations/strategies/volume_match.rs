//! Volume matching pricing strategy.
//!
//! Starts from the market's reference price and moves it towards the side
//! with more volume:
//!
//! ```text
//! imbalance = (B - S) / (B + S)
//! tolerance = min(slippage_bps of the heavier side) / 10_000
//! clearing  = P * (1 + imbalance * tolerance)
//! ```
//!
//! Equal buy and sell volume clears at exactly the reference price. The
//! shift never exceeds the tightest slippage bound of the heavier side, so
//! every member of that side accepts the result.

use crate::{side_volume, BatchError, PricingStrategy};
use async_trait::async_trait;
use auction_types::{ConfigSchema, DecryptedIntent, Field, FieldType, Schema, Side, ValidationError};
use rust_decimal::{Decimal, RoundingStrategy};

const BPS_DENOMINATOR: u32 = 10_000;
const DEFAULT_SCALE: u32 = 8;

pub struct VolumeMatch {
	scale: u32,
}

impl VolumeMatch {
	/// Creates the strategy rounding prices to `scale` decimal places.
	pub fn new(scale: u32) -> Self {
		Self { scale }
	}
}

impl Default for VolumeMatch {
	fn default() -> Self {
		Self::new(DEFAULT_SCALE)
	}
}

pub struct VolumeMatchSchema;

impl ConfigSchema for VolumeMatchSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![],
			vec![Field::new(
				"scale",
				FieldType::Integer {
					min: Some(0),
					max: Some(18),
				},
			)],
		)
		.validate(config)
	}
}

#[async_trait]
impl PricingStrategy for VolumeMatch {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(VolumeMatchSchema)
	}

	async fn clearing_price(
		&self,
		reference_price: Decimal,
		intents: &[DecryptedIntent],
	) -> Result<Decimal, BatchError> {
		if reference_price <= Decimal::ZERO {
			return Err(BatchError::Pricing(format!(
				"reference price must be positive, got {}",
				reference_price
			)));
		}

		let buy = side_volume(intents, Side::Buy)?;
		let sell = side_volume(intents, Side::Sell)?;
		let total = buy.checked_add(sell).ok_or_else(overflow)?;
		if total <= Decimal::ZERO {
			return Err(BatchError::Pricing("batch has no volume".to_string()));
		}
		if buy == sell {
			return Ok(reference_price);
		}

		let heavier = if buy > sell { Side::Buy } else { Side::Sell };
		let tightest_bps = intents
			.iter()
			.filter(|intent| intent.side == heavier)
			.map(|intent| intent.slippage_bps)
			.min()
			.unwrap_or(0);

		let imbalance = (buy - sell) / total;
		let tolerance = Decimal::from(tightest_bps) / Decimal::from(BPS_DENOMINATOR);
		let price = imbalance
			.checked_mul(tolerance)
			.and_then(|shift| Decimal::ONE.checked_add(shift))
			.and_then(|factor| reference_price.checked_mul(factor))
			.ok_or_else(overflow)?;

		Ok(price.round_dp_with_strategy(self.scale, RoundingStrategy::MidpointNearestEven))
	}
}

fn overflow() -> BatchError {
	BatchError::Pricing("clearing price overflows".to_string())
}

/// Creates the volume matching strategy.
///
/// Configuration parameters:
/// - `scale`: decimal places of the clearing price (default: 8)
pub fn create_strategy(config: &toml::Value) -> Result<Box<dyn PricingStrategy>, BatchError> {
	VolumeMatchSchema
		.validate(config)
		.map_err(|e| BatchError::Configuration(e.to_string()))?;

	let scale = config
		.get("scale")
		.and_then(|v| v.as_integer())
		.map(|scale| scale as u32)
		.unwrap_or(DEFAULT_SCALE);

	Ok(Box::new(VolumeMatch::new(scale)))
}
