//! Intent types for the sealed auction.
//!
//! An intent is a trade order encrypted under a time-lock condition. Its
//! lifecycle is modelled as a tagged state so that fields which only exist
//! once an intent is opened or settled cannot be observed in other states.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{epoch_of, BatchKey, TransactionHash};

/// Unique identifier assigned to an intent at submission.
pub type IntentId = String;

/// Normalizes an owner identity so lookups are case-insensitive.
pub fn normalize_owner(owner: &str) -> String {
	owner.trim().to_ascii_lowercase()
}

/// Direction of a trade intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
	Buy,
	Sell,
}

impl fmt::Display for Side {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Side::Buy => write!(f, "buy"),
			Side::Sell => write!(f, "sell"),
		}
	}
}

impl FromStr for Side {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"buy" => Ok(Side::Buy),
			"sell" => Ok(Side::Sell),
			other => Err(format!("unknown side '{}'", other)),
		}
	}
}

/// Plaintext content of an intent, available once the time-lock opens.
///
/// The sealed payload is the JSON encoding of this structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedIntent {
	/// Market symbol such as `ETH/USDC`.
	pub market: String,
	/// Trade direction.
	pub side: Side,
	/// Amount of the base asset.
	pub amount: Decimal,
	/// Maximum tolerated deviation from the reference price, in basis points.
	pub slippage_bps: u32,
}

impl DecryptedIntent {
	/// Upper bound for `slippage_bps` (100%).
	pub const MAX_SLIPPAGE_BPS: u32 = 10_000;

	/// Checks the fields that must hold for a payload to be tradeable.
	pub fn validate(&self) -> Result<(), String> {
		if self.market.trim().is_empty() {
			return Err("market must not be empty".to_string());
		}
		if self.amount <= Decimal::ZERO {
			return Err(format!("amount must be positive, got {}", self.amount));
		}
		if self.slippage_bps > Self::MAX_SLIPPAGE_BPS {
			return Err(format!(
				"slippageBps must be at most {}, got {}",
				Self::MAX_SLIPPAGE_BPS,
				self.slippage_bps
			));
		}
		Ok(())
	}

	/// Encodes the intent as the plaintext that gets sealed.
	pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	/// Decodes and validates an opened plaintext payload.
	pub fn from_payload(payload: &[u8]) -> Result<Self, String> {
		let decoded: Self = serde_json::from_slice(payload)
			.map_err(|e| format!("payload is not a valid intent: {}", e))?;
		decoded.validate()?;
		Ok(decoded)
	}
}

/// Opaque time-locked payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(#[serde(with = "crate::serde_hex")] pub Vec<u8>);

impl Ciphertext {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Display for Ciphertext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", crate::serde_hex::encode(&self.0))
	}
}

/// Block at which a ciphertext was revealed to be unlockable.
///
/// The oracle's own report is authoritative. When the oracle does not
/// report one, the block at which opening was attempted is recorded instead
/// and flagged as inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "confidence", content = "block", rename_all = "snake_case")]
pub enum UnlockEvidence {
	Reported(u64),
	Inferred(u64),
}

impl UnlockEvidence {
	pub fn block(&self) -> u64 {
		match self {
			UnlockEvidence::Reported(block) | UnlockEvidence::Inferred(block) => *block,
		}
	}

	pub fn is_authoritative(&self) -> bool {
		matches!(self, UnlockEvidence::Reported(_))
	}
}

/// Why an intent ended up in the terminal `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
	/// The oracle rejected the ciphertext structurally.
	CorruptCiphertext { message: String },
	/// The ciphertext opened but the plaintext is not a valid intent.
	MalformedPayload { message: String },
	/// The oracle reported an unlock block different from the declared target.
	ConditionMismatch {
		target_block: u64,
		revealed_block: u64,
	},
	/// The oracle kept reporting the ciphertext as sealed past its target block.
	StillSealed { attempts: u32 },
}

impl fmt::Display for FailureReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FailureReason::CorruptCiphertext { message } => {
				write!(f, "corrupt ciphertext: {}", message)
			}
			FailureReason::MalformedPayload { message } => {
				write!(f, "malformed payload: {}", message)
			}
			FailureReason::ConditionMismatch {
				target_block,
				revealed_block,
			} => write!(
				f,
				"sealed for block {} but declared target block {}",
				revealed_block, target_block
			),
			FailureReason::StillSealed { attempts } => {
				write!(f, "still sealed after {} open attempts", attempts)
			}
		}
	}
}

/// Field-less lifecycle discriminant, used as the expected value of a
/// compare-and-swap transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
	Pending,
	Ready,
	Settled,
	Failed,
}

impl IntentStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, IntentStatus::Settled | IntentStatus::Failed)
	}

	/// Whether a regular transition from `self` to `next` is allowed.
	///
	/// `Pending -> Pending` records another open attempt. `Settled -> Ready`
	/// is deliberately absent: it is only reachable through settlement
	/// reconciliation.
	pub fn permits(self, next: IntentStatus) -> bool {
		matches!(
			(self, next),
			(IntentStatus::Pending, IntentStatus::Pending)
				| (IntentStatus::Pending, IntentStatus::Ready)
				| (IntentStatus::Pending, IntentStatus::Failed)
				| (IntentStatus::Ready, IntentStatus::Settled)
		)
	}
}

impl fmt::Display for IntentStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			IntentStatus::Pending => "pending",
			IntentStatus::Ready => "ready",
			IntentStatus::Settled => "settled",
			IntentStatus::Failed => "failed",
		};
		write!(f, "{}", name)
	}
}

/// Lifecycle state of an intent together with the data owned by that state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntentState {
	/// Sealed, waiting for its target block and a successful open.
	Pending,
	/// Opened and eligible for its epoch batch.
	Ready {
		decrypted: DecryptedIntent,
		unlock: UnlockEvidence,
	},
	/// Included in a confirmed batch settlement.
	Settled {
		decrypted: DecryptedIntent,
		unlock: UnlockEvidence,
		batch_id: String,
		inclusion_block: u64,
		settlement_price: Decimal,
		tx_hash: TransactionHash,
	},
	/// Permanently failed to open.
	Failed { reason: FailureReason },
}

impl IntentState {
	pub fn status(&self) -> IntentStatus {
		match self {
			IntentState::Pending => IntentStatus::Pending,
			IntentState::Ready { .. } => IntentStatus::Ready,
			IntentState::Settled { .. } => IntentStatus::Settled,
			IntentState::Failed { .. } => IntentStatus::Failed,
		}
	}

	pub fn decrypted(&self) -> Option<&DecryptedIntent> {
		match self {
			IntentState::Ready { decrypted, .. } | IntentState::Settled { decrypted, .. } => {
				Some(decrypted)
			}
			IntentState::Pending | IntentState::Failed { .. } => None,
		}
	}

	pub fn inclusion_block(&self) -> Option<u64> {
		match self {
			IntentState::Settled {
				inclusion_block, ..
			} => Some(*inclusion_block),
			_ => None,
		}
	}

	pub fn settlement_price(&self) -> Option<Decimal> {
		match self {
			IntentState::Settled {
				settlement_price, ..
			} => Some(*settlement_price),
			_ => None,
		}
	}
}

/// A submitted intent and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
	/// Unique identifier, immutable.
	pub id: IntentId,
	/// Normalized identity of the submitter, immutable.
	pub owner: String,
	/// Block height before which the payload stays sealed, immutable.
	pub target_block: u64,
	/// Sealed payload, immutable.
	pub ciphertext: Ciphertext,
	/// Unix timestamp of submission.
	pub submitted_at: u64,
	/// Ledger transaction that carried the ciphertext, if any.
	pub submission_tx: Option<TransactionHash>,
	/// Number of open attempts that found the ciphertext still sealed.
	pub open_attempts: u32,
	/// Current lifecycle state.
	pub state: IntentState,
}

impl Intent {
	pub fn status(&self) -> IntentStatus {
		self.state.status()
	}

	/// Epoch this intent belongs to, fixed by its target block.
	pub fn epoch(&self, epoch_size: u64) -> u64 {
		epoch_of(self.target_block, epoch_size)
	}

	/// Batch this intent belongs to. Only known once the market is revealed.
	pub fn batch_key(&self, epoch_size: u64) -> Option<BatchKey> {
		self.state
			.decrypted()
			.map(|decrypted| BatchKey::new(decrypted.market.clone(), self.epoch(epoch_size)))
	}
}
