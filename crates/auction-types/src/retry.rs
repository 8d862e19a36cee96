//! Exponential backoff for calls to external services.
//!
//! The time-lock oracle and the ledger are both reached over the network.
//! Transient failures of either are retried here; permanent ones are
//! returned immediately so that callers never retry them blindly.

use backoff::{backoff::Backoff, ExponentialBackoff};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	/// Retries after the first attempt.
	pub max_retries: u32,
	pub initial_interval: Duration,
	/// Total time budget after which no further retry is scheduled.
	pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_interval: Duration::from_millis(200),
			max_elapsed: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;
		self
	}

	pub fn with_initial_interval(mut self, interval: Duration) -> Self {
		self.initial_interval = interval;
		self
	}

	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoff {
			initial_interval: self.initial_interval,
			current_interval: self.initial_interval,
			max_elapsed_time: Some(self.max_elapsed),
			..Default::default()
		}
	}

	/// Runs `operation` until it succeeds, fails permanently, or the policy
	/// is exhausted. `is_transient` decides which errors are worth retrying.
	pub async fn retry<T, E, F, Fut>(
		&self,
		name: &str,
		is_transient: impl Fn(&E) -> bool,
		mut operation: F,
	) -> Result<T, E>
	where
		E: Display,
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let mut backoff = self.backoff();
		let mut attempts = 0;

		loop {
			match operation().await {
				Ok(result) => return Ok(result),
				Err(e) if !is_transient(&e) => return Err(e),
				Err(e) => {
					attempts += 1;
					if attempts > self.max_retries {
						warn!(operation = name, attempts, error = %e, "giving up after retries");
						return Err(e);
					}
					match backoff.next_backoff() {
						Some(delay) => {
							warn!(
								operation = name,
								attempt = attempts,
								max_retries = self.max_retries,
								?delay,
								error = %e,
								"transient failure, retrying"
							);
							tokio::time::sleep(delay).await;
						}
						None => {
							warn!(operation = name, attempts, error = %e, "backoff exhausted");
							return Err(e);
						}
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn fast() -> RetryPolicy {
		RetryPolicy::default().with_initial_interval(Duration::from_millis(1))
	}

	#[tokio::test]
	async fn test_transient_errors_are_retried() {
		let calls = AtomicU32::new(0);
		let result: Result<u32, String> = fast()
			.retry(
				"flaky",
				|_| true,
				|| async {
					if calls.fetch_add(1, Ordering::SeqCst) < 2 {
						Err("down".to_string())
					} else {
						Ok(7)
					}
				},
			)
			.await;
		assert_eq!(result.unwrap(), 7);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_permanent_errors_return_immediately() {
		let calls = AtomicU32::new(0);
		let result: Result<(), String> = fast()
			.retry(
				"broken",
				|e: &String| e != "corrupt",
				|| async {
					calls.fetch_add(1, Ordering::SeqCst);
					Err("corrupt".to_string())
				},
			)
			.await;
		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_retries_are_bounded() {
		let calls = AtomicU32::new(0);
		let result: Result<(), String> = fast()
			.with_max_retries(2)
			.retry(
				"down",
				|_| true,
				|| async {
					calls.fetch_add(1, Ordering::SeqCst);
					Err("down".to_string())
				},
			)
			.await;
		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
