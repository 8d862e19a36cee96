//! Time-lock codec for the auction.
//!
//! The encryption primitive is an external oracle: given a payload and a
//! future block height it produces a ciphertext that the oracle will only
//! open once that height is reached. This crate defines the oracle adapter
//! interface and the [`TimelockService`] that every caller goes through.
//!
//! The service enforces the seal precondition, bounds each oracle call by a
//! timeout and retries outages with backoff. Outages surface as
//! [`TimelockError`]. A structurally rejected ciphertext is an
//! [`OpenOutcome::Corrupt`] value instead, so the two can never be mixed up.

use async_trait::async_trait;
use auction_types::{Ciphertext, ConfigSchema, RetryPolicy};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

pub mod implementations {
	pub mod http;
	pub mod local;
}

#[derive(Debug, Error)]
pub enum TimelockError {
	/// The oracle could not be reached or answered with a server error.
	#[error("Encryption unavailable: {0}")]
	EncryptionUnavailable(String),
	#[error("Unlock block {unlock_block} must be greater than current block {current_block}")]
	InvalidCondition {
		unlock_block: u64,
		current_block: u64,
	},
	#[error("Oracle call timed out after {0:?}")]
	Timeout(Duration),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl TimelockError {
	/// Outages that are retried with backoff.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			TimelockError::EncryptionUnavailable(_) | TimelockError::Timeout(_)
		)
	}
}

/// Result of probing a ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
	/// The payload, with the unlock block if the oracle reports one.
	Opened {
		payload: Vec<u8>,
		unlock_block: Option<u64>,
	},
	/// Not yet openable. Expected while the target block is pending.
	StillSealed,
	/// Permanently unopenable.
	Corrupt(String),
}

/// Adapter over a time-lock encryption oracle.
///
/// `try_open` must not have side effects: callers try speculatively and
/// repeatedly.
#[async_trait]
pub trait TimelockInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	async fn seal(&self, payload: &[u8], unlock_block: u64) -> Result<Ciphertext, TimelockError>;

	async fn try_open(
		&self,
		ciphertext: &Ciphertext,
		current_block: u64,
	) -> Result<OpenOutcome, TimelockError>;
}

pub struct TimelockService {
	oracle: Box<dyn TimelockInterface>,
	timeout: Duration,
	retry: RetryPolicy,
}

impl TimelockService {
	pub fn new(oracle: Box<dyn TimelockInterface>, timeout: Duration, max_retries: u32) -> Self {
		Self {
			oracle,
			timeout,
			retry: RetryPolicy::default().with_max_retries(max_retries),
		}
	}

	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	async fn bounded<T, F>(&self, call: F) -> Result<T, TimelockError>
	where
		F: std::future::Future<Output = Result<T, TimelockError>>,
	{
		tokio::time::timeout(self.timeout, call)
			.await
			.map_err(|_| TimelockError::Timeout(self.timeout))?
	}

	/// Seals `payload` so that it opens at `unlock_block`.
	///
	/// The unlock block must lie strictly after `current_block`.
	#[instrument(skip(self, payload), fields(payload_len = payload.len()))]
	pub async fn seal(
		&self,
		payload: &[u8],
		unlock_block: u64,
		current_block: u64,
	) -> Result<Ciphertext, TimelockError> {
		if unlock_block <= current_block {
			return Err(TimelockError::InvalidCondition {
				unlock_block,
				current_block,
			});
		}

		let ciphertext = self
			.retry
			.retry("timelock.seal", TimelockError::is_transient, || {
				self.bounded(self.oracle.seal(payload, unlock_block))
			})
			.await?;
		debug!(ciphertext_len = ciphertext.len(), "payload sealed");
		Ok(ciphertext)
	}

	/// Tries to open a ciphertext at `current_block`.
	pub async fn try_open(
		&self,
		ciphertext: &Ciphertext,
		current_block: u64,
	) -> Result<OpenOutcome, TimelockError> {
		self.retry
			.retry("timelock.open", TimelockError::is_transient, || {
				self.bounded(self.oracle.try_open(ciphertext, current_block))
			})
			.await
	}
}
