//! In-memory storage backend.
//!
//! Values live in a `DashMap`. Compare-and-swap runs under the shard lock of
//! the entry, so it is atomic with respect to every other operation on the
//! same key.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use auction_types::{ConfigSchema, Schema};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStorage {
	data: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(Schema::empty())
	}

	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.data
			.get(key)
			.map(|value| value.clone())
			.ok_or(StorageError::NotFound)
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		Ok(self
			.data
			.iter()
			.filter(|entry| entry.key().starts_with(prefix))
			.map(|entry| entry.key().clone())
			.collect())
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: Option<&[u8]>,
		new: Vec<u8>,
	) -> Result<bool, StorageError> {
		match (self.data.entry(key.to_string()), expected) {
			(Entry::Occupied(mut occupied), Some(expected)) if occupied.get() == expected => {
				occupied.insert(new);
				Ok(true)
			}
			(Entry::Vacant(vacant), None) => {
				vacant.insert(new);
				Ok(true)
			}
			_ => Ok(false),
		}
	}
}

/// Creates an in-memory backend. It takes no configuration.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	let storage = MemoryStorage::new();
	storage
		.config_schema()
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;
	Ok(Box::new(storage))
}
