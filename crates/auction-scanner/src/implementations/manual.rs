//! Manually driven block source.
//!
//! The height is shared with [`ManualBlockHandle`]s, so tests and local
//! deployments can move the chain forward, or backwards to simulate a reorg.
//! With `auto_advance_ms` set the height also grows by one block per interval.

use crate::{BlockSourceInterface, ScannerError};
use async_trait::async_trait;
use auction_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct ManualState {
	height: u64,
	since: Instant,
}

/// Cloneable control over a [`ManualBlockSource`].
#[derive(Clone)]
pub struct ManualBlockHandle {
	state: Arc<Mutex<ManualState>>,
	auto_advance: Option<Duration>,
}

impl ManualBlockHandle {
	fn with_state<T>(&self, f: impl FnOnce(&mut ManualState) -> T) -> T {
		let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		f(&mut state)
	}

	fn materialize(&self, state: &mut ManualState) -> u64 {
		if let Some(tick) = self.auto_advance {
			let ticks = state.since.elapsed().as_millis() / tick.as_millis().max(1);
			state.height = state.height.saturating_add(ticks as u64);
			state.since += tick * ticks as u32;
		}
		state.height
	}

	pub fn current(&self) -> u64 {
		self.with_state(|state| self.materialize(state))
	}

	/// Moves the head to `height`, which may be lower than the current one.
	pub fn set(&self, height: u64) {
		self.with_state(|state| {
			state.height = height;
			state.since = Instant::now();
		});
	}

	/// Moves the head forward and returns the new height.
	pub fn advance(&self, blocks: u64) -> u64 {
		self.with_state(|state| {
			let height = self.materialize(state).saturating_add(blocks);
			state.height = height;
			height
		})
	}

	/// A block source sharing this handle's height.
	pub fn source(&self) -> ManualBlockSource {
		ManualBlockSource {
			handle: self.clone(),
		}
	}
}

pub struct ManualBlockSource {
	handle: ManualBlockHandle,
}

impl ManualBlockSource {
	pub fn new(start_block: u64, auto_advance: Option<Duration>) -> Self {
		Self {
			handle: ManualBlockHandle {
				state: Arc::new(Mutex::new(ManualState {
					height: start_block,
					since: Instant::now(),
				})),
				auto_advance,
			},
		}
	}

	pub fn handle(&self) -> ManualBlockHandle {
		self.handle.clone()
	}
}

#[async_trait]
impl BlockSourceInterface for ManualBlockSource {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(ManualBlockSourceSchema)
	}

	async fn current_block(&self) -> Result<u64, ScannerError> {
		Ok(self.handle.current())
	}
}

pub struct ManualBlockSourceSchema;

impl ConfigSchema for ManualBlockSourceSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![],
			vec![
				Field::new(
					"start_block",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
				Field::new(
					"auto_advance_ms",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
			],
		)
		.validate(config)
	}
}

/// Creates a manual block source.
///
/// Configuration parameters:
/// - `start_block`: initial height (default: 0)
/// - `auto_advance_ms`: produce one block per interval (default: disabled)
pub fn create_block_source(
	config: &toml::Value,
) -> Result<Box<dyn BlockSourceInterface>, ScannerError> {
	ManualBlockSourceSchema
		.validate(config)
		.map_err(|e| ScannerError::Configuration(e.to_string()))?;

	let start_block = config
		.get("start_block")
		.and_then(|v| v.as_integer())
		.unwrap_or(0) as u64;
	let auto_advance = config
		.get("auto_advance_ms")
		.and_then(|v| v.as_integer())
		.map(|ms| Duration::from_millis(ms as u64));

	Ok(Box::new(ManualBlockSource::new(start_block, auto_advance)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_handle_controls_height() {
		let source = ManualBlockSource::new(10, None);
		let handle = source.handle();

		assert_eq!(source.current_block().await.unwrap(), 10);
		assert_eq!(handle.advance(3), 13);
		handle.set(11);
		assert_eq!(source.current_block().await.unwrap(), 11);
	}

	#[tokio::test]
	async fn test_auto_advance_produces_blocks() {
		let source = ManualBlockSource::new(0, Some(Duration::from_millis(5)));
		tokio::time::sleep(Duration::from_millis(30)).await;
		let height = source.current_block().await.unwrap();
		assert!(height >= 3, "height {height} did not advance");
	}
}
