//! Shared types for the sealed intent auction.
//!
//! Every pipeline crate speaks in terms of the records defined here: intents
//! and their lifecycle states, epoch batches, ledger transactions and the
//! events broadcast between services.

pub mod batch;
pub mod delivery;
pub mod events;
pub mod intent;
pub mod retry;
pub mod serde_hex;
pub mod validation;

pub use batch::*;
pub use delivery::*;
pub use events::*;
pub use intent::*;
pub use retry::RetryPolicy;
pub use validation::*;

/// Current unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
	chrono::Utc::now().timestamp().max(0) as u64
}
