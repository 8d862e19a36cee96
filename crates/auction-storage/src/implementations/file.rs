//! File-based storage backend.
//!
//! Each key is stored as one file whose name is the hex encoding of the key,
//! so keys containing `/` or `:` (market symbols, namespaces) round-trip
//! through directory listings. Writes go through a temp file and a rename.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use auction_types::{ConfigSchema, Field, FieldType, Schema};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

pub struct FileStorage {
	base_path: PathBuf,
	/// Serializes compare-and-swap against other writers in this process.
	write_lock: Mutex<()>,
}

impl FileStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self {
			base_path,
			write_lock: Mutex::new(()),
		}
	}

	fn get_file_path(&self, key: &str) -> PathBuf {
		self.base_path.join(format!("{}.bin", hex::encode(key)))
	}

	async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		match fs::read(self.get_file_path(key)).await {
			Ok(data) => Ok(Some(data)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		fs::create_dir_all(&self.base_path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let path = self.get_file_path(key);
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, value)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema::schema())
	}

	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.read(key).await?.ok_or(StorageError::NotFound)
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut keys = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let name = entry.file_name();
			let Some(encoded) = name.to_str().and_then(|n| n.strip_suffix(".bin")) else {
				continue;
			};
			let Some(key) = hex::decode(encoded)
				.ok()
				.and_then(|bytes| String::from_utf8(bytes).ok())
			else {
				continue;
			};
			if key.starts_with(prefix) {
				keys.push(key);
			}
		}
		Ok(keys)
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: Option<&[u8]>,
		new: Vec<u8>,
	) -> Result<bool, StorageError> {
		let _guard = self.write_lock.lock().await;
		let current = self.read(key).await?;
		if current.as_deref() != expected {
			return Ok(false);
		}
		self.write(key, new).await?;
		Ok(true)
	}
}

pub struct FileStorageSchema;

impl FileStorageSchema {
	fn schema() -> Schema {
		Schema::new(vec![], vec![Field::new("storage_path", FieldType::String)])
	}
}

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), auction_types::ValidationError> {
		Self::schema().validate(config)
	}
}

/// Creates a file backend.
///
/// Configuration parameters:
/// - `storage_path`: base directory (default: `./data/storage`)
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::new(PathBuf::from(storage_path))))
}
