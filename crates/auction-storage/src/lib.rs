//! Storage module for the auction.
//!
//! This module provides a byte-level key/value abstraction with pluggable
//! backends, a typed [`StorageService`] on top of it, and the two record
//! stores of the pipeline: the [`IntentStore`] and the [`BatchStore`].
//!
//! Every mutation of a shared record goes through compare-and-swap. Readers
//! obtain a [`Versioned`] value that remembers the exact bytes it was decoded
//! from, and writers only succeed if those bytes are still current.

use async_trait::async_trait;
use auction_types::ConfigSchema;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod batches;
pub mod intents;

pub use batches::{BatchStore, BatchStoreError};
pub use intents::{IntentPatch, IntentStore, IntentStoreError};

pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found")]
	NotFound,
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Low-level interface for storage backends.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Lists all keys starting with `prefix`, in no particular order.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	/// Atomically replaces the value of `key` with `new` if its current value
	/// equals `expected`. `None` means the key must be absent.
	///
	/// Returns `false` without writing when the comparison fails.
	async fn compare_and_swap(
		&self,
		key: &str,
		expected: Option<&[u8]>,
		new: Vec<u8>,
	) -> Result<bool, StorageError>;
}

/// A decoded value together with the stored bytes it was read from.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
	pub value: T,
	version: Vec<u8>,
}

impl<T> Versioned<T> {
	pub fn into_inner(self) -> T {
		self.value
	}
}

impl<T> std::ops::Deref for Versioned<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.value
	}
}

fn key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn encode<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Typed storage over a backend. Values are JSON encoded and keyed by
/// `namespace:id`.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&key(namespace, id)).await?;
		decode(&bytes)
	}

	/// Reads a value and remembers its version for a later
	/// [`compare_and_swap`](Self::compare_and_swap).
	pub async fn retrieve_versioned<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Versioned<T>, StorageError> {
		let bytes = self.backend.get_bytes(&key(namespace, id)).await?;
		Ok(Versioned {
			value: decode(&bytes)?,
			version: bytes,
		})
	}

	/// Writes `data` only if nothing is stored under the key yet.
	pub async fn insert_if_absent<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<bool, StorageError> {
		self.backend
			.compare_and_swap(&key(namespace, id), None, encode(data)?)
			.await
	}

	/// Replaces `current` with `next` unless the record changed since it was read.
	pub async fn compare_and_swap<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		current: &Versioned<T>,
		next: &T,
	) -> Result<bool, StorageError> {
		self.backend
			.compare_and_swap(&key(namespace, id), Some(&current.version), encode(next)?)
			.await
	}

	/// Lists the ids stored in a namespace.
	pub async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = key(namespace, "");
		let keys = self.backend.list_keys(&prefix).await?;
		Ok(keys
			.into_iter()
			.filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
			.collect())
	}

	/// Decodes every value in a namespace.
	pub async fn list<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>, StorageError> {
		let mut values = Vec::new();
		for id in self.list_ids(namespace).await? {
			values.push(self.retrieve(namespace, &id).await?);
		}
		Ok(values)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Record {
		value: u32,
	}

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[tokio::test]
	async fn test_versioned_swap_detects_concurrent_write() {
		let storage = service();
		assert!(storage
			.insert_if_absent("records", "a", &Record { value: 1 })
			.await
			.unwrap());
		assert!(!storage
			.insert_if_absent("records", "a", &Record { value: 9 })
			.await
			.unwrap());

		let first = storage
			.retrieve_versioned::<Record>("records", "a")
			.await
			.unwrap();
		let second = storage
			.retrieve_versioned::<Record>("records", "a")
			.await
			.unwrap();

		assert!(storage
			.compare_and_swap("records", "a", &first, &Record { value: 2 })
			.await
			.unwrap());
		assert!(!storage
			.compare_and_swap("records", "a", &second, &Record { value: 3 })
			.await
			.unwrap());

		let stored: Record = storage.retrieve("records", "a").await.unwrap();
		assert_eq!(stored.value, 2);
	}

	#[tokio::test]
	async fn test_list_is_scoped_to_namespace() {
		let storage = service();
		let records = [("records", "a", 1), ("records", "b", 2), ("other", "c", 3)];
		for (namespace, id, value) in records {
			storage
				.insert_if_absent(namespace, id, &Record { value })
				.await
				.unwrap();
		}

		let mut ids = storage.list_ids("records").await.unwrap();
		ids.sort();
		assert_eq!(ids, vec!["a", "b"]);
		assert_eq!(storage.list::<Record>("other").await.unwrap().len(), 1);
	}
}
