//! Deterministic in-process time-lock oracle.
//!
//! Meant for development and tests. The envelope carries its unlock block in
//! clear, and the body is XORed with a keccak keystream derived from a shared
//! secret. The oracle refuses to open before the unlock block, which is all
//! the pipeline relies on; it is not a cryptographic time-lock.
//!
//! Envelope layout: `magic(4) | unlock_block(8, BE) | nonce(16) | tag(32) | body`.

use crate::{OpenOutcome, TimelockError, TimelockInterface};
use async_trait::async_trait;
use auction_types::{Ciphertext, ConfigSchema, Field, FieldType, Schema, ValidationError};
use sha3::{Digest, Keccak256};

const MAGIC: &[u8; 4] = b"TLK1";
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 8 + NONCE_LEN + TAG_LEN;

pub struct LocalTimelock {
	secret: Vec<u8>,
	/// When false the oracle opens ciphertexts without reporting the unlock
	/// block, like oracles that only answer "opened or not".
	report_unlock_block: bool,
	/// Blocks the oracle lags behind the unlock condition.
	reveal_lag_blocks: u64,
}

impl LocalTimelock {
	pub fn new(
		secret: impl Into<String>,
		report_unlock_block: bool,
		reveal_lag_blocks: u64,
	) -> Self {
		Self {
			secret: secret.into().into_bytes(),
			report_unlock_block,
			reveal_lag_blocks,
		}
	}

	fn keystream_xor(&self, nonce: &[u8], unlock_block: u64, data: &[u8]) -> Vec<u8> {
		data.chunks(32)
			.enumerate()
			.flat_map(|(counter, chunk)| {
				let block = Keccak256::new()
					.chain_update(&self.secret)
					.chain_update(nonce)
					.chain_update(unlock_block.to_be_bytes())
					.chain_update((counter as u64).to_be_bytes())
					.finalize();
				chunk
					.iter()
					.zip(block)
					.map(|(byte, key)| byte ^ key)
					.collect::<Vec<u8>>()
			})
			.collect()
	}

	fn tag(&self, unlock_block: u64, nonce: &[u8], body: &[u8]) -> [u8; TAG_LEN] {
		Keccak256::new()
			.chain_update(b"tag")
			.chain_update(&self.secret)
			.chain_update(unlock_block.to_be_bytes())
			.chain_update(nonce)
			.chain_update(body)
			.finalize()
			.into()
	}
}

#[async_trait]
impl TimelockInterface for LocalTimelock {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalTimelockSchema)
	}

	async fn seal(&self, payload: &[u8], unlock_block: u64) -> Result<Ciphertext, TimelockError> {
		let nonce = *uuid::Uuid::new_v4().as_bytes();
		let body = self.keystream_xor(&nonce, unlock_block, payload);
		let tag = self.tag(unlock_block, &nonce, &body);

		let mut envelope = Vec::with_capacity(HEADER_LEN + body.len());
		envelope.extend_from_slice(MAGIC);
		envelope.extend_from_slice(&unlock_block.to_be_bytes());
		envelope.extend_from_slice(&nonce);
		envelope.extend_from_slice(&tag);
		envelope.extend_from_slice(&body);
		Ok(Ciphertext(envelope))
	}

	async fn try_open(
		&self,
		ciphertext: &Ciphertext,
		current_block: u64,
	) -> Result<OpenOutcome, TimelockError> {
		let bytes = ciphertext.as_bytes();
		if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
			return Ok(OpenOutcome::Corrupt("unrecognized envelope".to_string()));
		}

		let mut block_bytes = [0u8; 8];
		block_bytes.copy_from_slice(&bytes[4..12]);
		let unlock_block = u64::from_be_bytes(block_bytes);
		let nonce = &bytes[12..12 + NONCE_LEN];
		let tag = &bytes[12 + NONCE_LEN..HEADER_LEN];
		let body = &bytes[HEADER_LEN..];

		if current_block < unlock_block.saturating_add(self.reveal_lag_blocks) {
			return Ok(OpenOutcome::StillSealed);
		}
		if self.tag(unlock_block, nonce, body).as_slice() != tag {
			return Ok(OpenOutcome::Corrupt(
				"authentication tag mismatch".to_string(),
			));
		}

		Ok(OpenOutcome::Opened {
			payload: self.keystream_xor(nonce, unlock_block, body),
			unlock_block: self.report_unlock_block.then_some(unlock_block),
		})
	}
}

pub struct LocalTimelockSchema;

impl ConfigSchema for LocalTimelockSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![],
			vec![
				Field::new("secret", FieldType::String).with_validator(auction_types::non_empty),
				Field::new("report_unlock_block", FieldType::Boolean),
				Field::new(
					"reveal_lag_blocks",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
			],
		)
		.validate(config)
	}
}

/// Creates the local oracle.
///
/// Configuration parameters:
/// - `secret`: keystream secret (default: `auction-local-timelock`)
/// - `report_unlock_block`: report the unlock block on open (default: true)
/// - `reveal_lag_blocks`: blocks the oracle lags behind the condition (default: 0)
pub fn create_timelock(config: &toml::Value) -> Result<Box<dyn TimelockInterface>, TimelockError> {
	LocalTimelockSchema
		.validate(config)
		.map_err(|e| TimelockError::Configuration(e.to_string()))?;

	let secret = config
		.get("secret")
		.and_then(|v| v.as_str())
		.unwrap_or("auction-local-timelock");
	let report_unlock_block = config
		.get("report_unlock_block")
		.and_then(|v| v.as_bool())
		.unwrap_or(true);
	let reveal_lag_blocks = config
		.get("reveal_lag_blocks")
		.and_then(|v| v.as_integer())
		.unwrap_or(0) as u64;

	Ok(Box::new(LocalTimelock::new(
		secret,
		report_unlock_block,
		reveal_lag_blocks,
	)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_try_open_is_repeatable() {
		let oracle = LocalTimelock::new("s", true, 0);
		let sealed = oracle.seal(b"hello world", 10).await.unwrap();

		for _ in 0..3 {
			assert_eq!(
				oracle.try_open(&sealed, 9).await.unwrap(),
				OpenOutcome::StillSealed
			);
		}
		for _ in 0..2 {
			assert!(matches!(
				oracle.try_open(&sealed, 12).await.unwrap(),
				OpenOutcome::Opened {
					ref payload,
					unlock_block: Some(10),
				} if payload == b"hello world"
			));
		}
	}

	#[tokio::test]
	async fn test_tampered_and_foreign_envelopes_are_corrupt() {
		let oracle = LocalTimelock::new("s", true, 0);
		let mut sealed = oracle.seal(b"hello", 10).await.unwrap();
		let last = sealed.0.len() - 1;
		sealed.0[last] ^= 0xff;
		assert!(matches!(
			oracle.try_open(&sealed, 10).await.unwrap(),
			OpenOutcome::Corrupt(_)
		));

		assert!(matches!(
			oracle.try_open(&Ciphertext(b"garbage".to_vec()), 10).await.unwrap(),
			OpenOutcome::Corrupt(_)
		));

		let other = LocalTimelock::new("other", true, 0);
		let foreign = other.seal(b"hello", 10).await.unwrap();
		assert!(matches!(
			oracle.try_open(&foreign, 10).await.unwrap(),
			OpenOutcome::Corrupt(_)
		));
	}

	#[tokio::test]
	async fn test_unreported_unlock_and_lag() {
		let oracle = LocalTimelock::new("s", false, 2);
		let sealed = oracle.seal(b"x", 10).await.unwrap();

		assert_eq!(
			oracle.try_open(&sealed, 11).await.unwrap(),
			OpenOutcome::StillSealed
		);
		assert_eq!(
			oracle.try_open(&sealed, 12).await.unwrap(),
			OpenOutcome::Opened {
				payload: b"x".to_vec(),
				unlock_block: None,
			}
		);
	}

	#[test]
	fn test_factory_validates_config() {
		let bad = toml::Value::Table("secret = \"\"".parse::<toml::Table>().unwrap());
		assert!(create_timelock(&bad).is_err());
		let ok = toml::Value::Table("reveal_lag_blocks = 1".parse::<toml::Table>().unwrap());
		assert!(create_timelock(&ok).is_ok());
	}
}
