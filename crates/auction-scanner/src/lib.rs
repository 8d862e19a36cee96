//! Block observation and intent eligibility scanning.
//!
//! A [`BlockSourceInterface`] reports the ledger's current height. The
//! [`BlockMonitor`] polls it and forwards every change, including dips caused
//! by reorgs. For each observed block the [`EligibilityScanner`] tries to open
//! the pending intents whose target block has been reached.

use async_trait::async_trait;
use auction_types::ConfigSchema;
use thiserror::Error;

pub mod monitor;
pub mod scanner;

pub use monitor::{BlockMonitor, BlockObservation};
pub use scanner::{EligibilityScanner, ScanReport};

pub mod implementations {
	pub mod manual;
	pub mod rpc;
}

#[derive(Debug, Error)]
pub enum ScannerError {
	#[error("Connection error: {0}")]
	Connection(String),
	#[error("Already monitoring")]
	AlreadyMonitoring,
	#[error("Configuration error: {0}")]
	Configuration(String),
	#[error("Store error: {0}")]
	Store(#[from] auction_storage::IntentStoreError),
}

/// Source of the ledger's current block height.
///
/// Heights are not assumed to be monotonic: a source may report a lower
/// height than before when the ledger reorganizes.
#[async_trait]
pub trait BlockSourceInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	async fn current_block(&self) -> Result<u64, ScannerError>;
}
