//! Backend registration for the auction builder.

use auction_batch::implementations::{oracles, strategies};
use auction_core::AuctionBuilder;
use auction_delivery::implementations::{evm, local as local_ledger};
use auction_scanner::implementations::{manual, rpc};
use auction_storage::implementations::{file, memory};
use auction_timelock::implementations::{http, local as local_timelock};

/// Registers every backend this binary ships with, keyed by the names used
/// in configuration files.
pub fn register(builder: AuctionBuilder) -> AuctionBuilder {
	builder
		.with_storage_factory("memory", memory::create_storage)
		.with_storage_factory("file", file::create_storage)
		.with_timelock_factory("local", local_timelock::create_timelock)
		.with_timelock_factory("http", http::create_timelock)
		.with_block_source_factory("manual", manual::create_block_source)
		.with_block_source_factory("rpc", rpc::create_block_source)
		.with_delivery_factory("local", local_ledger::create_delivery)
		.with_delivery_factory("alloy", evm::alloy::create_delivery)
		.with_strategy_factory("volume_match", strategies::volume_match::create_strategy)
		.with_oracle_factory("fixed", oracles::fixed::create_oracle)
		.with_oracle_factory("http", oracles::http::create_oracle)
}
