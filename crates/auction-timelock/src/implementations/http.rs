//! Remote time-lock oracle over HTTP.
//!
//! Expects a JSON API with two endpoints:
//! - `POST {endpoint}/seal` with `{"payload": "0x..", "unlockBlock": n}`,
//!   answering `{"ciphertext": "0x.."}`
//! - `POST {endpoint}/open` with `{"ciphertext": "0x..", "currentBlock": n}`,
//!   answering `{"status": "opened" | "sealed" | "corrupt", ...}`
//!
//! Transport errors and 5xx answers are outages. Only an explicit `corrupt`
//! answer (or a 4xx rejection of the ciphertext) marks a ciphertext corrupt.

use crate::{OpenOutcome, TimelockError, TimelockInterface};
use async_trait::async_trait;
use auction_types::{
	serde_hex, Ciphertext, ConfigSchema, Field, FieldType, Schema, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub struct HttpTimelock {
	client: reqwest::Client,
	endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SealRequest {
	payload: String,
	unlock_block: u64,
}

#[derive(Deserialize)]
struct SealResponse {
	ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenRequest {
	ciphertext: String,
	current_block: u64,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum OpenResponse {
	#[serde(rename_all = "camelCase")]
	Opened {
		payload: String,
		#[serde(default)]
		unlock_block: Option<u64>,
	},
	Sealed,
	Corrupt {
		#[serde(default)]
		error: Option<String>,
	},
}

impl HttpTimelock {
	pub fn new(
		endpoint: impl Into<String>,
		request_timeout: Duration,
	) -> Result<Self, TimelockError> {
		let client = reqwest::Client::builder()
			.timeout(request_timeout)
			.build()
			.map_err(|e| TimelockError::Configuration(e.to_string()))?;
		Ok(Self {
			client,
			endpoint: endpoint.into().trim_end_matches('/').to_string(),
		})
	}

	async fn post<B: Serialize + Sync>(
		&self,
		path: &str,
		body: &B,
	) -> Result<reqwest::Response, TimelockError> {
		let url = format!("{}/{}", self.endpoint, path);
		let response = self
			.client
			.post(&url)
			.json(body)
			.send()
			.await
			.map_err(|e| TimelockError::EncryptionUnavailable(format!("{}: {}", url, e)))?;

		if response.status().is_server_error() {
			return Err(TimelockError::EncryptionUnavailable(format!(
				"{} answered {}",
				url,
				response.status()
			)));
		}
		Ok(response)
	}
}

#[async_trait]
impl TimelockInterface for HttpTimelock {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(HttpTimelockSchema)
	}

	async fn seal(&self, payload: &[u8], unlock_block: u64) -> Result<Ciphertext, TimelockError> {
		let response = self
			.post(
				"seal",
				&SealRequest {
					payload: serde_hex::encode(payload),
					unlock_block,
				},
			)
			.await?;

		if !response.status().is_success() {
			return Err(TimelockError::EncryptionUnavailable(format!(
				"seal rejected with {}",
				response.status()
			)));
		}

		let body: SealResponse = response
			.json()
			.await
			.map_err(|e| {
				TimelockError::EncryptionUnavailable(format!("invalid seal response: {}", e))
			})?;
		let bytes = serde_hex::decode(&body.ciphertext).map_err(|e| {
			TimelockError::EncryptionUnavailable(format!("invalid ciphertext encoding: {}", e))
		})?;
		Ok(Ciphertext(bytes))
	}

	async fn try_open(
		&self,
		ciphertext: &Ciphertext,
		current_block: u64,
	) -> Result<OpenOutcome, TimelockError> {
		let response = self
			.post(
				"open",
				&OpenRequest {
					ciphertext: ciphertext.to_string(),
					current_block,
				},
			)
			.await?;

		let status = response.status();
		if status.is_client_error() {
			let message = response.text().await.unwrap_or_default();
			debug!(%status, "oracle rejected ciphertext");
			return Ok(OpenOutcome::Corrupt(format!("{}: {}", status, message)));
		}

		let body: OpenResponse = response
			.json()
			.await
			.map_err(|e| {
				TimelockError::EncryptionUnavailable(format!("invalid open response: {}", e))
			})?;

		Ok(match body {
			OpenResponse::Opened {
				payload,
				unlock_block,
			} => match serde_hex::decode(&payload) {
				Ok(payload) => OpenOutcome::Opened {
					payload,
					unlock_block,
				},
				Err(e) => OpenOutcome::Corrupt(format!("payload is not hex: {}", e)),
			},
			OpenResponse::Sealed => OpenOutcome::StillSealed,
			OpenResponse::Corrupt { error } => {
				OpenOutcome::Corrupt(error.unwrap_or_else(|| "rejected by oracle".to_string()))
			}
		})
	}
}

pub struct HttpTimelockSchema;

impl ConfigSchema for HttpTimelockSchema {
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

/// Creates the HTTP oracle adapter.
///
/// Configuration parameters:
/// - `endpoint`: base URL of the oracle API (required)
/// - `request_timeout_ms`: per-request timeout (default: 3000)
pub fn create_timelock(config: &toml::Value) -> Result<Box<dyn TimelockInterface>, TimelockError> {
	HttpTimelockSchema
		.validate(config)
		.map_err(|e| TimelockError::Configuration(e.to_string()))?;

	let endpoint = config
		.get("endpoint")
		.and_then(|v| v.as_str())
		.ok_or_else(|| TimelockError::Configuration("endpoint is required".to_string()))?;
	let timeout_ms = config
		.get("request_timeout_ms")
		.and_then(|v| v.as_integer())
		.unwrap_or(3_000) as u64;

	Ok(Box::new(HttpTimelock::new(
		endpoint,
		Duration::from_millis(timeout_ms),
	)?))
}
