//! Storage module for the mealflow order coordination system.
//!
//! This module provides abstractions for persistent storage of order
//! data, supporting different backend implementations such as in-memory
//! or file-based storage systems.
//!
//! Every stored value carries a monotonically increasing sequence
//! number. Writes may pass the sequence number they last observed, and
//! the backend rejects the write with [`StorageError::Conflict`] when
//! the value has moved on in the meantime. This compare-and-set
//! protocol is what the state machine builds its optimistic concurrency
//! control on.

use async_trait::async_trait;
use mealflow_types::{ConfigSchema, ImplementationRegistry, StorageKey};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs when a conditional write loses a race: the
	/// stored sequence number no longer matches the expected one.
	#[error("Sequence conflict: expected {expected}, found {found}")]
	Conflict { expected: u64, found: u64 },
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// A single conditional write inside a batch.
#[derive(Debug, Clone)]
pub struct PutOp {
	/// Full storage key, namespace and id joined with ':'.
	pub key: String,
	/// Serialized value.
	pub value: Vec<u8>,
	/// Expected current sequence number. `None` writes unconditionally,
	/// `Some(0)` requires the key to be absent (create-only), any other
	/// value must match the stored sequence exactly.
	pub expected_seq: Option<u64>,
	/// Optional time-to-live for the written value.
	pub ttl: Option<Duration>,
}

/// Trait defining the low-level interface for storage backends.
///
/// Backends provide versioned key-value operations with optional TTL.
/// Sequence numbers start at 1 on creation and increase by one per
/// write; an expired entry counts as absent.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes and the current sequence number for the key.
	async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, u64), StorageError>;

	/// Stores raw bytes, optionally conditional on the current sequence
	/// number (see [`PutOp::expected_seq`] for the convention). Returns
	/// the sequence number of the written value.
	async fn put_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		expected_seq: Option<u64>,
		ttl: Option<Duration>,
	) -> Result<u64, StorageError>;

	/// Applies a batch of conditional writes.
	///
	/// All sequence preconditions are checked before any write is
	/// applied, so a batch either takes effect as a whole or rejects
	/// with the first conflict and leaves storage untouched.
	async fn put_many(&self, ops: Vec<PutOp>) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Checks if a key exists in storage.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Lists all keys starting with the given prefix, sorted
	/// lexicographically. Expired entries are not listed.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries from storage (optional operation).
	/// Returns the number of entries removed.
	/// Implementations that don't support expiration can return Ok(0).
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0) // Default implementation for backends without TTL support
	}
}

/// Type alias for storage factory functions.
///
/// This is the function signature that all storage implementations must provide
/// to create instances of their storage interface.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
///
/// Returns a vector of (name, factory) tuples for all available storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// A deserialized value together with the sequence number it was read
/// at. The sequence number is what callers hand back as `expected_seq`
/// when they write the value's successor.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
	pub value: T,
	pub version: u64,
}

/// A batch of typed conditional writes, committed atomically through
/// [`StorageService::commit`].
#[derive(Debug, Default)]
pub struct WriteBatch {
	ops: Vec<PutOp>,
}

impl WriteBatch {
	pub fn new() -> Self {
		Self { ops: Vec::new() }
	}

	/// Adds a conditional write to the batch.
	pub fn put<T: Serialize>(
		&mut self,
		namespace: StorageKey,
		id: &str,
		data: &T,
		expected_seq: Option<u64>,
		ttl: Option<Duration>,
	) -> Result<&mut Self, StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.ops.push(PutOp {
			key: format!("{}:{}", namespace.as_str(), id),
			value: bytes,
			expected_seq,
			ttl,
		});
		Ok(self)
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	fn into_ops(self) -> Vec<PutOp> {
		self.ops
	}
}

/// High-level storage service that provides typed operations.
///
/// The StorageService wraps a low-level storage backend and provides
/// convenient methods for storing and retrieving typed data with
/// automatic serialization/deserialization.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	fn key(namespace: StorageKey, id: &str) -> String {
		format!("{}:{}", namespace.as_str(), id)
	}

	/// Creates a value that must not exist yet.
	///
	/// Fails with [`StorageError::Conflict`] when the key is already
	/// present, which is how first-writer-wins races are decided.
	pub async fn create<T: Serialize>(
		&self,
		namespace: StorageKey,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<u64, StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.put_bytes(&Self::key(namespace, id), bytes, Some(0), ttl)
			.await
	}

	/// Stores a value unconditionally, creating or overwriting.
	pub async fn store<T: Serialize>(
		&self,
		namespace: StorageKey,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<u64, StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.put_bytes(&Self::key(namespace, id), bytes, None, ttl)
			.await
	}

	/// Replaces an existing value conditional on the version it was
	/// read at. Returns the new version on success.
	pub async fn update<T: Serialize>(
		&self,
		namespace: StorageKey,
		id: &str,
		data: &T,
		expected_version: u64,
	) -> Result<u64, StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.put_bytes(&Self::key(namespace, id), bytes, Some(expected_version), None)
			.await
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: StorageKey,
		id: &str,
	) -> Result<T, StorageError> {
		Ok(self.retrieve_versioned(namespace, id).await?.value)
	}

	/// Retrieves a value together with its current version.
	pub async fn retrieve_versioned<T: DeserializeOwned>(
		&self,
		namespace: StorageKey,
		id: &str,
	) -> Result<Versioned<T>, StorageError> {
		let (bytes, version) = self.backend.get_bytes(&Self::key(namespace, id)).await?;
		let value = serde_json::from_slice(&bytes)
			.map_err(|e| StorageError::Serialization(e.to_string()))?;
		Ok(Versioned { value, version })
	}

	/// Commits a batch of conditional writes atomically.
	pub async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
		self.backend.put_many(batch.into_ops()).await
	}

	/// Removes a value from storage.
	pub async fn remove(&self, namespace: StorageKey, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&Self::key(namespace, id)).await
	}

	/// Checks if a value exists in storage.
	pub async fn exists(&self, namespace: StorageKey, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&Self::key(namespace, id)).await
	}

	/// Lists ids in a namespace whose id starts with the given prefix,
	/// sorted lexicographically. Pass an empty prefix to list the whole
	/// namespace.
	pub async fn list_ids(
		&self,
		namespace: StorageKey,
		id_prefix: &str,
	) -> Result<Vec<String>, StorageError> {
		let full_prefix = format!("{}:{}", namespace.as_str(), id_prefix);
		let keys = self.backend.list_keys(&full_prefix).await?;
		let ns_prefix = format!("{}:", namespace.as_str());
		Ok(keys
			.into_iter()
			.filter_map(|k| k.strip_prefix(&ns_prefix).map(|s| s.to_string()))
			.collect())
	}

	/// Removes expired entries from storage.
	///
	/// Returns the number of entries that were removed.
	/// This is a no-op for backends that don't support TTL.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}
}
