//! Closed batch records.
//!
//! A batch is written once by the batch builder with insert-if-absent, which
//! makes the first computed clearing price the permanent one. Later status
//! changes by the settlement dispatcher are compare-and-swap updates.

use crate::{StorageError, StorageService, Versioned};
use auction_types::{Batch, BatchKey};
use std::sync::Arc;
use thiserror::Error;

const NAMESPACE: &str = "batches";

#[derive(Debug, Error)]
pub enum BatchStoreError {
	#[error("Batch {0} changed concurrently")]
	StaleState(String),
	#[error("Batch {0} not found")]
	NotFound(String),
	#[error("Batch {0} cannot change its key, members or price")]
	Immutable(String),
	#[error(transparent)]
	Storage(#[from] StorageError),
}

pub struct BatchStore {
	storage: Arc<StorageService>,
}

impl BatchStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	pub async fn get(&self, key: &BatchKey) -> Result<Option<Batch>, BatchStoreError> {
		Ok(self.get_versioned(key).await?.map(Versioned::into_inner))
	}

	pub async fn get_versioned(
		&self,
		key: &BatchKey,
	) -> Result<Option<Versioned<Batch>>, BatchStoreError> {
		match self.storage.retrieve_versioned(NAMESPACE, &key.id()).await {
			Ok(batch) => Ok(Some(batch)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Persists `batch` unless one already exists for its key, and returns
	/// whichever batch is stored afterwards.
	pub async fn insert_if_absent(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
		if self
			.storage
			.insert_if_absent(NAMESPACE, &batch.id(), &batch)
			.await?
		{
			return Ok(batch);
		}
		self.get(&batch.key)
			.await?
			.ok_or_else(|| BatchStoreError::NotFound(batch.id()))
	}

	/// Replaces a previously read batch. Only the settlement status may change.
	pub async fn update(
		&self,
		current: &Versioned<Batch>,
		next: Batch,
	) -> Result<Batch, BatchStoreError> {
		if current.key != next.key
			|| current.members != next.members
			|| current.clearing_price != next.clearing_price
		{
			return Err(BatchStoreError::Immutable(current.id()));
		}
		if !self
			.storage
			.compare_and_swap(NAMESPACE, &next.id(), current, &next)
			.await?
		{
			return Err(BatchStoreError::StaleState(next.id()));
		}
		Ok(next)
	}

	/// All batches ordered by epoch, then market.
	pub async fn list(&self) -> Result<Vec<Batch>, BatchStoreError> {
		let mut batches: Vec<Batch> = self.storage.list(NAMESPACE).await?;
		batches.sort_by(|a, b| {
			a.key
				.epoch
				.cmp(&b.key.epoch)
				.then_with(|| a.key.market.cmp(&b.key.market))
		});
		Ok(batches)
	}
}
