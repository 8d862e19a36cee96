//! Calldata for the auction contract.
//!
//! Prices are fixed point with 18 decimals. Intent ids are UUID strings on
//! our side and their keccak hash on chain.

use crate::DeliveryError;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use auction_types::{Batch, Ciphertext, Transaction, TransactionKind};
use rust_decimal::Decimal;

sol! {
	interface ISealedAuction {
		function submitIntent(bytes ciphertext, uint64 targetBlock) external returns (bytes32);
		function settleBatch(
			string market,
			uint64 epoch,
			uint256 clearingPrice,
			bytes32[] intentIds
		) external;
	}
}

const PRICE_DECIMALS: u32 = 18;

/// Scales a price to an 18-decimal fixed point integer.
pub fn price_to_fixed(price: Decimal) -> Result<U256, DeliveryError> {
	if price.is_sign_negative() {
		return Err(DeliveryError::Encoding(format!(
			"price must not be negative: {}",
			price
		)));
	}
	let rounded = price.round_dp(PRICE_DECIMALS);
	let mantissa = u128::try_from(rounded.mantissa())
		.map_err(|_| DeliveryError::Encoding(format!("price out of range: {}", price)))?;
	let exponent = PRICE_DECIMALS - rounded.scale();
	Ok(U256::from(mantissa) * U256::from(10u64).pow(U256::from(exponent)))
}

/// On-chain identifier of an intent.
pub fn intent_key(intent_id: &str) -> B256 {
	keccak256(intent_id.as_bytes())
}

pub fn submit_intent_transaction(
	contract: Address,
	chain_id: u64,
	ciphertext: &Ciphertext,
	target_block: u64,
) -> Transaction {
	let data = ISealedAuction::submitIntentCall {
		ciphertext: Bytes::copy_from_slice(ciphertext.as_bytes()),
		targetBlock: target_block,
	}
	.abi_encode();

	Transaction {
		to: Some(contract),
		data,
		value: U256::ZERO,
		chain_id,
		gas_limit: None,
		kind: TransactionKind::IntentSubmission,
	}
}

pub fn settle_batch_transaction(
	contract: Address,
	chain_id: u64,
	batch: &Batch,
) -> Result<Transaction, DeliveryError> {
	let data = ISealedAuction::settleBatchCall {
		market: batch.key.market.clone(),
		epoch: batch.key.epoch,
		clearingPrice: price_to_fixed(batch.clearing_price)?,
		intentIds: batch.members.iter().map(|id| intent_key(id)).collect(),
	}
	.abi_encode();

	Ok(Transaction {
		to: Some(contract),
		data,
		value: U256::ZERO,
		chain_id,
		gas_limit: None,
		kind: TransactionKind::BatchSettlement,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use auction_types::{BatchKey, BatchStatus, PriceSource};
	use std::str::FromStr;

	#[test]
	fn test_price_scaling() {
		let price = Decimal::from_str("1990.5").unwrap();
		assert_eq!(
			price_to_fixed(price).unwrap(),
			U256::from(1_990_500_000_000_000_000_000u128)
		);
		assert_eq!(price_to_fixed(Decimal::ZERO).unwrap(), U256::ZERO);
		assert!(price_to_fixed(Decimal::from(-1)).is_err());
	}

	#[test]
	fn test_settlement_calldata() {
		let batch = Batch {
			key: BatchKey::new("ETH/USDC", 4),
			members: vec!["a".to_string(), "b".to_string()],
			buy_volume: Decimal::ONE,
			sell_volume: Decimal::ONE,
			clearing_price: Decimal::from(2000),
			ai_price: None,
			price_source: PriceSource::Strategy,
			closed_at: 0,
			closed_at_block: 450,
			status: BatchStatus::Closed,
		};
		let contract = Address::repeat_byte(0x33);
		let tx = settle_batch_transaction(contract, 1, &batch).unwrap();
		assert_eq!(tx.to, Some(contract));
		assert_eq!(tx.kind, TransactionKind::BatchSettlement);

		let call = ISealedAuction::settleBatchCall::abi_decode(&tx.data).unwrap();
		assert_eq!(call.market, "ETH/USDC");
		assert_eq!(call.epoch, 4);
		assert_eq!(call.clearingPrice, U256::from(2000u64) * U256::from(10u64).pow(U256::from(18)));
		assert_eq!(call.intentIds, vec![intent_key("a"), intent_key("b")]);
	}

	#[test]
	fn test_submission_calldata() {
		let tx = submit_intent_transaction(Address::ZERO, 1, &Ciphertext(vec![9, 9]), 120);
		let call = ISealedAuction::submitIntentCall::abi_decode(&tx.data).unwrap();
		assert_eq!(call.targetBlock, 120);
		assert_eq!(call.ciphertext.to_vec(), vec![9, 9]);
	}
}
