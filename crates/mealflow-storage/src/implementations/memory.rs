//! In-memory storage backend implementation.
//!
//! This module provides a memory-based implementation of the StorageInterface trait,
//! useful for testing and development scenarios where persistence is not required.

use crate::{PutOp, StorageError, StorageInterface};
use async_trait::async_trait;
use mealflow_types::{current_timestamp, ConfigSchema, ImplementationRegistry, Schema, ValidationError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// One stored value with its sequence number and optional expiry.
#[derive(Debug, Clone)]
struct Entry {
	bytes: Vec<u8>,
	seq: u64,
	/// Unix seconds, 0 = never expires.
	expires_at: u64,
}

impl Entry {
	fn is_expired(&self, now: u64) -> bool {
		self.expires_at != 0 && now >= self.expires_at
	}
}

/// In-memory storage implementation.
///
/// Stores data in a HashMap behind a read-write lock. Sequence checks
/// and batches run under the write lock, so the compare-and-set
/// contract holds without further coordination. TTL is honored: an
/// expired entry reads as absent and its sequence restarts at 1.
pub struct MemoryStorage {
	store: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance.
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

fn expiry_from_ttl(ttl: Option<Duration>, now: u64) -> u64 {
	match ttl {
		Some(ttl) if !ttl.is_zero() => now.saturating_add(ttl.as_secs()),
		_ => 0,
	}
}

/// Checks an expected sequence against the live entry for the key.
/// Returns the sequence the new value should carry.
fn next_seq(
	entry: Option<&Entry>,
	expected_seq: Option<u64>,
	now: u64,
) -> Result<u64, StorageError> {
	let current = match entry {
		Some(e) if !e.is_expired(now) => e.seq,
		_ => 0,
	};
	match expected_seq {
		None => Ok(current + 1),
		Some(expected) if expected == current => Ok(current + 1),
		// Conditional write against an absent key
		Some(expected) if current == 0 && expected != 0 => Err(StorageError::NotFound),
		Some(expected) => Err(StorageError::Conflict {
			expected,
			found: current,
		}),
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, u64), StorageError> {
		let now = current_timestamp();
		let store = self.store.read().await;
		match store.get(key) {
			Some(entry) if !entry.is_expired(now) => Ok((entry.bytes.clone(), entry.seq)),
			_ => Err(StorageError::NotFound),
		}
	}

	async fn put_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		expected_seq: Option<u64>,
		ttl: Option<Duration>,
	) -> Result<u64, StorageError> {
		let now = current_timestamp();
		let mut store = self.store.write().await;
		let seq = next_seq(store.get(key), expected_seq, now)?;
		store.insert(
			key.to_string(),
			Entry {
				bytes: value,
				seq,
				expires_at: expiry_from_ttl(ttl, now),
			},
		);
		Ok(seq)
	}

	async fn put_many(&self, ops: Vec<PutOp>) -> Result<(), StorageError> {
		let now = current_timestamp();
		let mut store = self.store.write().await;

		// Validate every precondition before touching anything
		let mut staged = Vec::with_capacity(ops.len());
		for op in &ops {
			staged.push(next_seq(store.get(&op.key), op.expected_seq, now)?);
		}

		for (op, seq) in ops.into_iter().zip(staged) {
			let expires_at = expiry_from_ttl(op.ttl, now);
			store.insert(
				op.key,
				Entry {
					bytes: op.value,
					seq,
					expires_at,
				},
			);
		}
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		store.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let now = current_timestamp();
		let store = self.store.read().await;
		Ok(matches!(store.get(key), Some(e) if !e.is_expired(now)))
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let now = current_timestamp();
		let store = self.store.read().await;
		let mut keys: Vec<String> = store
			.iter()
			.filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
			.map(|(k, _)| k.clone())
			.collect();
		keys.sort();
		Ok(keys)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let now = current_timestamp();
		let mut store = self.store.write().await;
		let before = store.len();
		store.retain(|_, e| !e.is_expired(now));
		Ok(before - store.len())
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory storage has no required configuration
		let schema = Schema::new(vec![], vec![]);
		schema.validate(config)
	}
}

/// Registry entry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}

/// Factory function to create a memory storage backend from configuration.
///
/// Configuration parameters:
/// - None required for memory storage
pub fn create_storage(_config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	Ok(Box::new(MemoryStorage::new()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();

		let key = "orders:test";
		let value = b"test_value".to_vec();
		let seq = storage.put_bytes(key, value.clone(), None, None).await.unwrap();
		assert_eq!(seq, 1);

		let (retrieved, seq) = storage.get_bytes(key).await.unwrap();
		assert_eq!(retrieved, value);
		assert_eq!(seq, 1);

		assert!(storage.exists(key).await.unwrap());

		storage.delete(key).await.unwrap();
		assert!(!storage.exists(key).await.unwrap());

		let result = storage.get_bytes(key).await;
		assert!(matches!(result, Err(StorageError::NotFound)));
	}

	#[tokio::test]
	async fn test_sequence_advances_per_write() {
		let storage = MemoryStorage::new();

		let key = "orders:seq";
		assert_eq!(storage.put_bytes(key, b"v1".to_vec(), None, None).await.unwrap(), 1);
		assert_eq!(storage.put_bytes(key, b"v2".to_vec(), None, None).await.unwrap(), 2);

		let (bytes, seq) = storage.get_bytes(key).await.unwrap();
		assert_eq!(bytes, b"v2");
		assert_eq!(seq, 2);
	}

	#[tokio::test]
	async fn test_create_only_rejects_existing() {
		let storage = MemoryStorage::new();

		let key = "orders:create";
		assert_eq!(storage.put_bytes(key, b"v1".to_vec(), Some(0), None).await.unwrap(), 1);

		let result = storage.put_bytes(key, b"v2".to_vec(), Some(0), None).await;
		assert!(matches!(result, Err(StorageError::Conflict { expected: 0, found: 1 })));
	}

	#[tokio::test]
	async fn test_stale_sequence_conflicts() {
		let storage = MemoryStorage::new();

		let key = "orders:cas";
		storage.put_bytes(key, b"v1".to_vec(), None, None).await.unwrap();
		storage.put_bytes(key, b"v2".to_vec(), Some(1), None).await.unwrap();

		// A writer still holding seq 1 must lose
		let result = storage.put_bytes(key, b"v3".to_vec(), Some(1), None).await;
		assert!(matches!(result, Err(StorageError::Conflict { expected: 1, found: 2 })));
	}

	#[tokio::test]
	async fn test_put_many_is_all_or_nothing() {
		let storage = MemoryStorage::new();

		storage.put_bytes("orders:a", b"a1".to_vec(), None, None).await.unwrap();

		let ops = vec![
			PutOp {
				key: "orders:a".into(),
				value: b"a2".to_vec(),
				expected_seq: Some(2), // stale, must fail
				ttl: None,
			},
			PutOp {
				key: "audit:a".into(),
				value: b"entry".to_vec(),
				expected_seq: Some(0),
				ttl: None,
			},
		];
		assert!(storage.put_many(ops).await.is_err());

		// The conflicting batch must not have written the audit row
		assert!(!storage.exists("audit:a").await.unwrap());
		let (bytes, _) = storage.get_bytes("orders:a").await.unwrap();
		assert_eq!(bytes, b"a1");
	}

	#[tokio::test]
	async fn test_expired_entry_reads_as_absent() {
		let storage = MemoryStorage::new();

		let key = "consumer_handled:ev-1";
		// Already-expired TTL
		{
			let mut store = storage.store.write().await;
			store.insert(
				key.to_string(),
				Entry {
					bytes: b"x".to_vec(),
					seq: 3,
					expires_at: 1,
				},
			);
		}

		assert!(matches!(storage.get_bytes(key).await, Err(StorageError::NotFound)));
		assert!(!storage.exists(key).await.unwrap());

		// Sequence restarts once the old value is gone
		let seq = storage.put_bytes(key, b"y".to_vec(), Some(0), None).await.unwrap();
		assert_eq!(seq, 1);

		assert_eq!(storage.cleanup_expired().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_list_keys_filters_by_prefix() {
		let storage = MemoryStorage::new();

		storage.put_bytes("outbox:o1:0000000001", b"e1".to_vec(), None, None).await.unwrap();
		storage.put_bytes("outbox:o1:0000000002", b"e2".to_vec(), None, None).await.unwrap();
		storage.put_bytes("outbox:o2:0000000001", b"e3".to_vec(), None, None).await.unwrap();
		storage.put_bytes("orders:o1", b"o".to_vec(), None, None).await.unwrap();

		let keys = storage.list_keys("outbox:o1:").await.unwrap();
		assert_eq!(keys, vec!["outbox:o1:0000000001", "outbox:o1:0000000002"]);

		let all = storage.list_keys("outbox:").await.unwrap();
		assert_eq!(all.len(), 3);
	}
}
