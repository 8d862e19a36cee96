//! The intent store.
//!
//! Single source of truth for intent records. All state changes go through
//! [`IntentStore::transition`], a compare-and-swap on the whole stored
//! record: a writer reads, checks the expected status, and only writes if no
//! other writer touched the record in between.

use crate::{StorageError, StorageService, Versioned};
use auction_types::{
	current_timestamp, normalize_owner, Ciphertext, Intent, IntentId, IntentState, IntentStatus,
	TransactionHash,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

const NAMESPACE: &str = "intents";

#[derive(Debug, Error)]
pub enum IntentStoreError {
	#[error("Intent not found: {0}")]
	NotFound(IntentId),
	#[error("Target block {target_block} must be greater than current block {current_block}")]
	InvalidTargetBlock {
		target_block: u64,
		current_block: u64,
	},
	#[error("Invalid input: {0}")]
	InvalidInput(String),
	#[error("Stale state for intent {id}: expected {expected}, found {actual}")]
	StaleState {
		id: IntentId,
		expected: IntentStatus,
		actual: IntentStatus,
	},
	#[error("Transition {from} -> {to} is not allowed")]
	InvalidTransition { from: IntentStatus, to: IntentStatus },
	#[error(transparent)]
	Storage(#[from] StorageError),
}

impl IntentStoreError {
	/// Conflicts that a caller resolves by re-reading, never shown to users.
	pub fn is_stale(&self) -> bool {
		matches!(self, IntentStoreError::StaleState { .. })
	}
}

/// Non-state fields that may change together with a transition.
#[derive(Debug, Clone, Default)]
pub struct IntentPatch {
	/// Absolute value, so a duplicate write of the same patch is harmless.
	pub open_attempts: Option<u32>,
}

pub struct IntentStore {
	storage: Arc<StorageService>,
}

impl IntentStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Records a new sealed intent in `Pending`.
	#[instrument(skip(self, ciphertext, submission_tx))]
	pub async fn create(
		&self,
		owner: &str,
		target_block: u64,
		ciphertext: Ciphertext,
		current_block: u64,
		submission_tx: Option<TransactionHash>,
	) -> Result<Intent, IntentStoreError> {
		if target_block <= current_block {
			return Err(IntentStoreError::InvalidTargetBlock {
				target_block,
				current_block,
			});
		}
		let owner = normalize_owner(owner);
		if owner.is_empty() {
			return Err(IntentStoreError::InvalidInput(
				"owner must not be empty".to_string(),
			));
		}
		if ciphertext.is_empty() {
			return Err(IntentStoreError::InvalidInput(
				"ciphertext must not be empty".to_string(),
			));
		}

		let intent = Intent {
			id: uuid::Uuid::new_v4().to_string(),
			owner,
			target_block,
			ciphertext,
			submitted_at: current_timestamp(),
			submission_tx,
			open_attempts: 0,
			state: IntentState::Pending,
		};

		if !self
			.storage
			.insert_if_absent(NAMESPACE, &intent.id, &intent)
			.await?
		{
			return Err(IntentStoreError::Storage(StorageError::Backend(format!(
				"intent id collision: {}",
				intent.id
			))));
		}

		debug!(intent_id = %intent.id, target_block, "intent created");
		Ok(intent)
	}

	pub async fn get(&self, id: &str) -> Result<Intent, IntentStoreError> {
		Ok(self.get_versioned(id).await?.into_inner())
	}

	async fn get_versioned(&self, id: &str) -> Result<Versioned<Intent>, IntentStoreError> {
		self.storage
			.retrieve_versioned(NAMESPACE, id)
			.await
			.map_err(|e| match e {
				StorageError::NotFound => IntentStoreError::NotFound(id.to_string()),
				other => other.into(),
			})
	}

	/// All intents, oldest first.
	pub async fn list(&self) -> Result<Vec<Intent>, IntentStoreError> {
		let mut intents: Vec<Intent> = self.storage.list(NAMESPACE).await?;
		intents.sort_by(|a, b| {
			a.submitted_at
				.cmp(&b.submitted_at)
				.then_with(|| a.id.cmp(&b.id))
		});
		Ok(intents)
	}

	pub async fn list_by_owner(&self, owner: &str) -> Result<Vec<Intent>, IntentStoreError> {
		let owner = normalize_owner(owner);
		Ok(self
			.list()
			.await?
			.into_iter()
			.filter(|intent| intent.owner == owner)
			.collect())
	}

	pub async fn list_by_status(
		&self,
		status: IntentStatus,
	) -> Result<Vec<Intent>, IntentStoreError> {
		Ok(self
			.list()
			.await?
			.into_iter()
			.filter(|intent| intent.status() == status)
			.collect())
	}

	/// Moves an intent from `expected` to `new_state`.
	///
	/// Fails with `InvalidTransition` before reading storage when the edge is
	/// not part of the lifecycle, and with `StaleState` when the stored status
	/// differs from `expected` or another writer won the race.
	#[instrument(skip(self, new_state, patch), fields(to = %new_state.status()))]
	pub async fn transition(
		&self,
		id: &str,
		expected: IntentStatus,
		new_state: IntentState,
		patch: IntentPatch,
	) -> Result<Intent, IntentStoreError> {
		let to = new_state.status();
		if !expected.permits(to) {
			return Err(IntentStoreError::InvalidTransition { from: expected, to });
		}

		let current = self.get_versioned(id).await?;
		self.swap(current, expected, new_state, patch).await
	}

	/// Returns a settled intent to `Ready` after its settlement vanished from
	/// the ledger. This is the only path by which an intent's state regresses,
	/// and it only applies to members of the given batch.
	#[instrument(skip(self))]
	pub async fn revert_settlement(
		&self,
		id: &str,
		batch_id: &str,
	) -> Result<Intent, IntentStoreError> {
		let current = self.get_versioned(id).await?;
		let restored = match &current.state {
			IntentState::Settled {
				decrypted,
				unlock,
				batch_id: settled_in,
				..
			} if settled_in == batch_id => IntentState::Ready {
				decrypted: decrypted.clone(),
				unlock: *unlock,
			},
			IntentState::Settled { .. } => {
				return Err(IntentStoreError::InvalidInput(format!(
					"intent {} was not settled in batch {}",
					id, batch_id
				)))
			}
			other => {
				return Err(IntentStoreError::StaleState {
					id: id.to_string(),
					expected: IntentStatus::Settled,
					actual: other.status(),
				})
			}
		};
		self.swap(current, IntentStatus::Settled, restored, IntentPatch::default())
			.await
	}

	async fn swap(
		&self,
		current: Versioned<Intent>,
		expected: IntentStatus,
		new_state: IntentState,
		patch: IntentPatch,
	) -> Result<Intent, IntentStoreError> {
		let actual = current.status();
		if actual != expected {
			return Err(IntentStoreError::StaleState {
				id: current.id.clone(),
				expected,
				actual,
			});
		}

		let mut next = current.value.clone();
		next.state = new_state;
		if let Some(open_attempts) = patch.open_attempts {
			next.open_attempts = open_attempts;
		}

		if !self
			.storage
			.compare_and_swap(NAMESPACE, &next.id, &current, &next)
			.await?
		{
			// Lost the race. Report what the winner left behind.
			let actual = self.get(&next.id).await?.status();
			return Err(IntentStoreError::StaleState {
				id: next.id,
				expected,
				actual,
			});
		}

		debug!(intent_id = %next.id, from = %expected, to = %next.status(), "intent transitioned");
		Ok(next)
	}
}
