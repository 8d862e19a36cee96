//! Remote price oracle over HTTP.
//!
//! Queries `GET {endpoint}/price?market=..&epoch=..` and expects
//! `{"price": "1990.5"}`. Numbers are accepted as well as strings.

use crate::{BatchError, PriceOracleInterface};
use async_trait::async_trait;
use auction_types::{BatchKey, ConfigSchema, Field, FieldType, Schema, ValidationError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct PriceResponse {
	price: Decimal,
}

pub struct HttpPriceOracle {
	client: reqwest::Client,
	endpoint: String,
}

impl HttpPriceOracle {
	pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, BatchError> {
		let client = reqwest::Client::builder()
			.timeout(request_timeout)
			.build()
			.map_err(|e| BatchError::Configuration(e.to_string()))?;
		Ok(Self {
			client,
			endpoint: endpoint.into().trim_end_matches('/').to_string(),
		})
	}
}

#[async_trait]
impl PriceOracleInterface for HttpPriceOracle {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(HttpPriceOracleSchema)
	}

	async fn quote(&self, key: &BatchKey) -> Result<Decimal, BatchError> {
		let url = format!("{}/price", self.endpoint);
		let epoch = key.epoch.to_string();
		let response = self
			.client
			.get(&url)
			.query(&[("market", key.market.as_str()), ("epoch", epoch.as_str())])
			.send()
			.await
			.map_err(|e| BatchError::Oracle(format!("{}: {}", url, e)))?;

		if !response.status().is_success() {
			return Err(BatchError::Oracle(format!(
				"{} answered {}",
				url,
				response.status()
			)));
		}

		let body: PriceResponse = response
			.json()
			.await
			.map_err(|e| BatchError::Oracle(format!("invalid price response: {}", e)))?;
		if body.price <= Decimal::ZERO {
			return Err(BatchError::Oracle(format!(
				"non-positive quote {} for {}",
				body.price, key
			)));
		}

		debug!(batch_id = %key, price = %body.price, "oracle quote received");
		Ok(body.price)
	}
}

pub struct HttpPriceOracleSchema;

impl ConfigSchema for HttpPriceOracleSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("endpoint", FieldType::String).with_validator(auction_types::http_url)],
			vec![Field::new(
				"request_timeout_ms",
				FieldType::Integer {
					min: Some(1),
					max: None,
				},
			)],
		)
		.validate(config)
	}
}

/// Creates the HTTP price oracle.
///
/// Configuration parameters:
/// - `endpoint`: base URL of the price API (required)
/// - `request_timeout_ms`: per-request timeout (default: 2000)
pub fn create_oracle(config: &toml::Value) -> Result<Box<dyn PriceOracleInterface>, BatchError> {
	HttpPriceOracleSchema
		.validate(config)
		.map_err(|e| BatchError::Configuration(e.to_string()))?;

	let endpoint = config
		.get("endpoint")
		.and_then(|v| v.as_str())
		.ok_or_else(|| BatchError::Configuration("endpoint is required".to_string()))?;
	let timeout = config
		.get("request_timeout_ms")
		.and_then(|v| v.as_integer())
		.unwrap_or(2_000) as u64;

	Ok(Box::new(HttpPriceOracle::new(
		endpoint,
		Duration::from_millis(timeout),
	)?))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_endpoint_required() {
		let missing = toml::Value::Table(toml::Table::new());
		assert!(create_oracle(&missing).is_err());

		let valid = toml::Value::Table(
			"endpoint = \"http://localhost:9000/\"".parse::<toml::Table>().unwrap(),
		);
		assert!(create_oracle(&valid).is_ok());
	}

	#[test]
	fn test_response_accepts_string_and_number() {
		let text: PriceResponse = serde_json::from_str(r#"{"price":"1990.5"}"#).unwrap();
		let number: PriceResponse = serde_json::from_str(r#"{"price":1990.5}"#).unwrap();
		assert_eq!(text.price, number.price);
	}
}
