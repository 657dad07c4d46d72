//! File-based storage backend implementation.
//!
//! This module provides a file-backed implementation of the StorageInterface
//! trait, offering simple persistence without external dependencies. Each
//! key maps to one file whose fixed-size header carries the sequence
//! number and expiry used by the compare-and-set protocol.

use crate::{PutOp, StorageError, StorageInterface};
use async_trait::async_trait;
use mealflow_types::{
	current_timestamp, ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, StorageKey,
	ValidationError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};

#[allow(clippy::doc_nested_refdefs)]
/// Fixed-size file header carrying version metadata.
///
/// Binary layout (64 bytes total):
/// - [0-3]: Magic bytes "MFLW"
/// - [4-5]: Format version (u16, little-endian)
/// - [6-13]: Sequence number (u64, little-endian)
/// - [14-21]: Expiration timestamp (u64, little-endian, Unix seconds, 0 = never)
/// - [22-63]: Reserved/padding for future use
#[derive(Debug, Clone)]
struct FileHeader {
	magic: [u8; 4],
	version: u16,
	seq: u64,
	expires_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"MFLW";
	const VERSION: u16 = 1;
	const SIZE: usize = 64;

	/// Creates a new header with the given sequence number and TTL.
	fn new(seq: u64, ttl: Duration) -> Self {
		let expires_at = if ttl.is_zero() {
			0 // Permanent storage
		} else {
			current_timestamp().saturating_add(ttl.as_secs())
		};

		Self {
			magic: *Self::MAGIC,
			version: Self::VERSION,
			seq,
			expires_at,
		}
	}

	/// Serializes the header to bytes.
	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(&self.magic);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.seq.to_le_bytes());
		bytes[14..22].copy_from_slice(&self.expires_at.to_le_bytes());
		bytes
	}

	/// Deserializes a header from bytes.
	fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("File too small for header".into()));
		}

		let mut magic = [0u8; 4];
		magic.copy_from_slice(&bytes[0..4]);

		if magic != *Self::MAGIC {
			return Err(StorageError::Backend("Unrecognized file format".into()));
		}

		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}

		let mut seq_bytes = [0u8; 8];
		seq_bytes.copy_from_slice(&bytes[6..14]);
		let seq = u64::from_le_bytes(seq_bytes);

		let mut expires_bytes = [0u8; 8];
		expires_bytes.copy_from_slice(&bytes[14..22]);
		let expires_at = u64::from_le_bytes(expires_bytes);

		Ok(Self {
			magic,
			version,
			seq,
			expires_at,
		})
	}

	/// Checks if the data has expired.
	fn is_expired(&self) -> bool {
		self.expires_at != 0 && current_timestamp() >= self.expires_at
	}
}

/// One resolved write inside a batch journal. The sequence number and
/// expiry are fixed when the journal is written, so replay reproduces
/// the exact files the interrupted batch would have produced.
#[derive(Debug, Clone, PartialEq)]
struct JournalEntry {
	key: String,
	seq: u64,
	expires_at: u64,
	value: Vec<u8>,
}

impl JournalEntry {
	fn header(&self) -> FileHeader {
		FileHeader {
			magic: *FileHeader::MAGIC,
			version: FileHeader::VERSION,
			seq: self.seq,
			expires_at: self.expires_at,
		}
	}
}

/// Magic bytes identifying a batch journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"MFLJ";

/// Serializes a batch journal.
///
/// Layout: magic, entry count (u32), then per entry key length (u32) +
/// key bytes, sequence (u64), expiry (u64), value length (u32) + value
/// bytes. All integers little-endian.
fn encode_journal(entries: &[JournalEntry]) -> Vec<u8> {
	let mut out = Vec::new();
	out.extend_from_slice(JOURNAL_MAGIC);
	out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
	for entry in entries {
		out.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
		out.extend_from_slice(entry.key.as_bytes());
		out.extend_from_slice(&entry.seq.to_le_bytes());
		out.extend_from_slice(&entry.expires_at.to_le_bytes());
		out.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
		out.extend_from_slice(&entry.value);
	}
	out
}

fn decode_journal(data: &[u8]) -> Result<Vec<JournalEntry>, StorageError> {
	struct Cursor<'a> {
		data: &'a [u8],
		pos: usize,
	}

	impl<'a> Cursor<'a> {
		fn take(&mut self, len: usize) -> Result<&'a [u8], StorageError> {
			let end = self
				.pos
				.checked_add(len)
				.filter(|end| *end <= self.data.len())
				.ok_or_else(|| StorageError::Backend("Truncated batch journal".into()))?;
			let slice = &self.data[self.pos..end];
			self.pos = end;
			Ok(slice)
		}

		fn take_u32(&mut self) -> Result<u32, StorageError> {
			let bytes = self.take(4)?;
			Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
		}

		fn take_u64(&mut self) -> Result<u64, StorageError> {
			let mut buf = [0u8; 8];
			buf.copy_from_slice(self.take(8)?);
			Ok(u64::from_le_bytes(buf))
		}
	}

	let mut cursor = Cursor { data, pos: 0 };
	if cursor.take(4)? != JOURNAL_MAGIC {
		return Err(StorageError::Backend("Unrecognized journal format".into()));
	}
	let count = cursor.take_u32()?;

	let mut entries = Vec::new();
	for _ in 0..count {
		let key_len = cursor.take_u32()? as usize;
		let key = String::from_utf8(cursor.take(key_len)?.to_vec())
			.map_err(|_| StorageError::Backend("Invalid key in batch journal".into()))?;
		let seq = cursor.take_u64()?;
		let expires_at = cursor.take_u64()?;
		let value_len = cursor.take_u32()? as usize;
		let value = cursor.take(value_len)?.to_vec();
		entries.push(JournalEntry {
			key,
			seq,
			expires_at,
			value,
		});
	}
	Ok(entries)
}

/// TTL configuration for different storage keys.
#[derive(Debug, Clone)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	/// Creates TTL config from TOML configuration.
	fn from_config(config: &toml::Value) -> Self {
		let mut ttls = HashMap::new();

		if let Some(table) = config.as_table() {
			for storage_key in StorageKey::all() {
				let config_key = format!("ttl_{}", storage_key.as_str());
				if let Some(ttl_value) = table
					.get(&config_key)
					.and_then(|v| v.as_integer())
					.map(|v| v as u64)
				{
					ttls.insert(storage_key, Duration::from_secs(ttl_value));
				}
			}
		}

		Self { ttls }
	}

	/// Gets the TTL for a specific storage key.
	fn get_ttl(&self, storage_key: StorageKey) -> Duration {
		self.ttls
			.get(&storage_key)
			.copied()
			.unwrap_or(Duration::ZERO)
	}
}

/// File-based storage implementation.
///
/// Keys are mapped onto the filesystem by their ':'-separated segments,
/// so `orders:123` becomes `<base>/orders/123.bin` and prefix listing
/// turns into a directory walk. All writes go through a single mutex;
/// this serializes the read-check-write step that implements the
/// sequence precondition, and batches hold the mutex across all their
/// writes. Batches additionally journal every resolved write to a
/// single file before touching any key; the journal rename is the
/// commit point, and a journal left behind by a crash is replayed
/// before the next operation.
pub struct FileStorage {
	/// Base directory path for storing files.
	base_path: PathBuf,
	/// TTL configuration for different storage keys.
	ttl_config: TtlConfig,
	/// Serializes conditional writes.
	write_lock: Mutex<()>,
	/// Set once a leftover batch journal has been replayed.
	recovered: OnceCell<()>,
}

impl FileStorage {
	/// Creates a new FileStorage instance with the specified base path and TTL config.
	pub fn new(base_path: PathBuf, ttl_config: TtlConfig) -> Self {
		Self {
			base_path,
			ttl_config,
			write_lock: Mutex::new(()),
			recovered: OnceCell::new(),
		}
	}

	/// Location of the batch journal. Not a `.bin` file, so it never
	/// shows up in key listings.
	fn journal_path(&self) -> PathBuf {
		self.base_path.join("batch.journal")
	}

	/// Replays a leftover batch journal once per instance, before the
	/// first read or write touches any file.
	async fn ensure_recovered(&self) -> Result<(), StorageError> {
		self.recovered
			.get_or_try_init(|| self.replay_journal())
			.await?;
		Ok(())
	}

	/// Re-applies a batch journal left behind by an interrupted
	/// `put_many`. Rewriting already-applied entries is harmless since
	/// replay produces byte-identical files.
	async fn replay_journal(&self) -> Result<(), StorageError> {
		let journal = self.journal_path();
		let data = match fs::read(&journal).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let entries = decode_journal(&data)?;
		for entry in &entries {
			self.write_with_header(&entry.key, &entry.value, &entry.header())
				.await?;
		}
		fs::remove_file(&journal)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		tracing::warn!(
			entries = entries.len(),
			"Replayed interrupted write batch from journal"
		);
		Ok(())
	}

	/// Converts a storage key to its file path. Each ':'-separated
	/// segment becomes a path component, sanitized to stay
	/// filesystem-safe.
	fn get_file_path(&self, key: &str) -> PathBuf {
		let mut path = self.base_path.clone();
		let mut segments = key.split(':').peekable();
		while let Some(segment) = segments.next() {
			let safe = segment.replace(['/', '\\'], "_");
			if segments.peek().is_some() {
				path.push(safe);
			} else {
				path.push(format!("{}.bin", safe));
			}
		}
		path
	}

	/// Reconstructs the storage key for a file under the base path.
	fn key_for_path(&self, path: &Path) -> Option<String> {
		let rel = path.strip_prefix(&self.base_path).ok()?;
		let mut segments: Vec<String> = rel
			.components()
			.map(|c| c.as_os_str().to_string_lossy().into_owned())
			.collect();
		let last = segments.pop()?;
		segments.push(last.strip_suffix(".bin")?.to_string());
		Some(segments.join(":"))
	}

	/// Gets the TTL for a given key based on its namespace.
	fn get_ttl_for_key(&self, key: &str) -> Duration {
		// Parse namespace from key (e.g., "orders:123" -> "orders")
		let namespace = key.split(':').next().unwrap_or("");
		namespace
			.parse::<StorageKey>()
			.map(|sk| self.ttl_config.get_ttl(sk))
			.unwrap_or(Duration::ZERO)
	}

	/// Reads the current header for a key, treating expired files and
	/// missing files as absent.
	async fn read_header(&self, path: &Path) -> Result<Option<FileHeader>, StorageError> {
		let data = match fs::read(path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};
		let header = FileHeader::deserialize(&data)?;
		if header.is_expired() {
			Ok(None)
		} else {
			Ok(Some(header))
		}
	}

	/// Checks the sequence precondition for a key and returns the
	/// sequence number a new write should carry. Callers must hold the
	/// write lock.
	async fn check_precondition(
		&self,
		key: &str,
		expected_seq: Option<u64>,
	) -> Result<u64, StorageError> {
		let path = self.get_file_path(key);
		let current = self.read_header(&path).await?.map(|h| h.seq).unwrap_or(0);
		match expected_seq {
			None => Ok(current + 1),
			Some(expected) if expected == current => Ok(current + 1),
			Some(expected) if current == 0 && expected != 0 => Err(StorageError::NotFound),
			Some(expected) => Err(StorageError::Conflict {
				expected,
				found: current,
			}),
		}
	}

	/// Writes one value with its header, atomically via temp file and
	/// rename. Callers must hold the write lock.
	async fn write_value(
		&self,
		key: &str,
		value: &[u8],
		seq: u64,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let ttl = ttl.unwrap_or_else(|| self.get_ttl_for_key(key));
		self.write_with_header(key, value, &FileHeader::new(seq, ttl))
			.await
	}

	async fn write_with_header(
		&self,
		key: &str,
		value: &[u8],
		header: &FileHeader,
	) -> Result<(), StorageError> {
		let path = self.get_file_path(key);

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?;
		}

		let mut file_data = Vec::with_capacity(FileHeader::SIZE + value.len());
		file_data.extend_from_slice(&header.serialize());
		file_data.extend_from_slice(value);

		// Write atomically by writing to temp file then renaming
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, file_data)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		Ok(())
	}

	/// Recursively collects all .bin files under a directory.
	async fn collect_files(&self, root: PathBuf, out: &mut Vec<PathBuf>) -> Result<(), StorageError> {
		let mut pending = vec![root];
		while let Some(dir) = pending.pop() {
			let mut entries = match fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
				Err(e) => return Err(StorageError::Backend(e.to_string())),
			};
			while let Some(entry) = entries
				.next_entry()
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?
			{
				let path = entry.path();
				if path.is_dir() {
					pending.push(path);
				} else if path.extension() == Some(std::ffi::OsStr::new("bin")) {
					out.push(path);
				}
			}
		}
		Ok(())
	}

	/// Removes all expired files from storage
	async fn cleanup_expired_files(&self) -> Result<usize, StorageError> {
		let mut files = Vec::new();
		self.collect_files(self.base_path.clone(), &mut files).await?;

		let mut removed = 0;
		for path in files {
			match fs::read(&path).await {
				Ok(data) => {
					if let Ok(header) = FileHeader::deserialize(&data) {
						if header.is_expired() {
							if let Err(e) = fs::remove_file(&path).await {
								tracing::warn!("Failed to remove expired file {:?}: {}", path, e);
							} else {
								removed += 1;
							}
						}
					}
				},
				Err(e) => {
					tracing::debug!("Skipping file {:?}: could not be read: {}", path, e);
				},
			}
		}
		Ok(removed)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, u64), StorageError> {
		self.ensure_recovered().await?;
		let path = self.get_file_path(key);

		let data = match fs::read(&path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(StorageError::NotFound)
			},
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let header = FileHeader::deserialize(&data)?;
		if header.is_expired() {
			return Err(StorageError::NotFound);
		}

		Ok((data[FileHeader::SIZE..].to_vec(), header.seq))
	}

	async fn put_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		expected_seq: Option<u64>,
		ttl: Option<Duration>,
	) -> Result<u64, StorageError> {
		self.ensure_recovered().await?;
		let _guard = self.write_lock.lock().await;
		let seq = self.check_precondition(key, expected_seq).await?;
		self.write_value(key, &value, seq, ttl).await?;
		Ok(seq)
	}

	async fn put_many(&self, ops: Vec<PutOp>) -> Result<(), StorageError> {
		self.ensure_recovered().await?;
		let _guard = self.write_lock.lock().await;

		// Validate every precondition before writing anything
		let mut staged = Vec::with_capacity(ops.len());
		for op in &ops {
			staged.push(self.check_precondition(&op.key, op.expected_seq).await?);
		}

		let entries: Vec<JournalEntry> = ops
			.into_iter()
			.zip(staged)
			.map(|(op, seq)| {
				let ttl = op.ttl.unwrap_or_else(|| self.get_ttl_for_key(&op.key));
				JournalEntry {
					expires_at: FileHeader::new(seq, ttl).expires_at,
					key: op.key,
					seq,
					value: op.value,
				}
			})
			.collect();

		// Renaming the journal into place is the commit point: a crash
		// afterwards replays the whole batch on the next open, so the
		// batch lands entirely or not at all.
		fs::create_dir_all(&self.base_path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		let journal = self.journal_path();
		let temp_path = self.base_path.join("batch.journal.tmp");
		fs::write(&temp_path, encode_journal(&entries))
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &journal)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		for entry in &entries {
			self.write_with_header(&entry.key, &entry.value, &entry.header())
				.await?;
		}

		fs::remove_file(&journal)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.ensure_recovered().await?;
		let path = self.get_file_path(key);

		match fs::remove_file(&path).await {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		self.ensure_recovered().await?;
		let path = self.get_file_path(key);
		Ok(self.read_header(&path).await?.is_some())
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		self.ensure_recovered().await?;
		// Walk from the namespace directory and filter by full prefix,
		// so partial last segments ("outbox:o1:00") still match.
		let namespace = prefix.split(':').next().unwrap_or("");
		let root = self.base_path.join(namespace.replace(['/', '\\'], "_"));

		let mut files = Vec::new();
		self.collect_files(root, &mut files).await?;

		let mut keys = Vec::new();
		for path in files {
			if self.read_header(&path).await?.is_none() {
				continue;
			}
			if let Some(key) = self.key_for_path(&path) {
				if key.starts_with(prefix) {
					keys.push(key);
				}
			}
		}
		keys.sort();
		Ok(keys)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.ensure_recovered().await?;
		self.cleanup_expired_files().await
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Build TTL fields dynamically based on StorageKey variants
		let mut optional_fields = vec![Field::new("storage_path", FieldType::String)];

		for storage_key in StorageKey::all() {
			let field_name = format!("ttl_{}", storage_key.as_str());
			optional_fields.push(Field::new(
				field_name,
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			));
		}

		let schema = Schema::new(
			vec![], // No required fields
			optional_fields,
		);
		schema.validate(config)
	}
}

/// Registry entry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
/// - `ttl_<namespace>`: TTL in seconds per storage namespace (default: 0, never expires)
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage")
		.to_string();

	let ttl_config = TtlConfig::from_config(config);

	Ok(Box::new(FileStorage::new(
		PathBuf::from(storage_path),
		ttl_config,
	)))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn storage(dir: &tempfile::TempDir) -> FileStorage {
		FileStorage::new(
			dir.path().to_path_buf(),
			TtlConfig::from_config(&toml::Value::Table(Default::default())),
		)
	}

	#[tokio::test]
	async fn test_round_trip_preserves_sequence() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		let seq = storage
			.put_bytes("orders:o-1", b"payload".to_vec(), Some(0), None)
			.await
			.unwrap();
		assert_eq!(seq, 1);

		let (bytes, seq) = storage.get_bytes("orders:o-1").await.unwrap();
		assert_eq!(bytes, b"payload");
		assert_eq!(seq, 1);

		let seq = storage
			.put_bytes("orders:o-1", b"payload2".to_vec(), Some(1), None)
			.await
			.unwrap();
		assert_eq!(seq, 2);
	}

	#[tokio::test]
	async fn test_conflict_detected_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let storage = storage(&dir);
			storage
				.put_bytes("orders:o-1", b"v1".to_vec(), Some(0), None)
				.await
				.unwrap();
		}

		// Sequence numbers live in the file header, so a fresh instance
		// still enforces them
		let storage = storage(&dir);
		let result = storage.put_bytes("orders:o-1", b"v2".to_vec(), Some(0), None).await;
		assert!(matches!(result, Err(StorageError::Conflict { expected: 0, found: 1 })));
	}

	#[tokio::test]
	async fn test_list_keys_walks_segment_directories() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		storage
			.put_bytes("outbox:o-1:0000000001", b"e1".to_vec(), None, None)
			.await
			.unwrap();
		storage
			.put_bytes("outbox:o-1:0000000002", b"e2".to_vec(), None, None)
			.await
			.unwrap();
		storage
			.put_bytes("outbox:o-2:0000000001", b"e3".to_vec(), None, None)
			.await
			.unwrap();

		let keys = storage.list_keys("outbox:o-1:").await.unwrap();
		assert_eq!(keys, vec!["outbox:o-1:0000000001", "outbox:o-1:0000000002"]);

		let all = storage.list_keys("outbox:").await.unwrap();
		assert_eq!(all.len(), 3);

		let none = storage.list_keys("orders:").await.unwrap();
		assert!(none.is_empty());
	}

	#[tokio::test]
	async fn test_put_many_commits_all_rows_and_consumes_journal() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		storage
			.put_many(vec![
				PutOp {
					key: "orders:o-1".into(),
					value: b"pending".to_vec(),
					expected_seq: Some(0),
					ttl: None,
				},
				PutOp {
					key: "audit:o-1:0000000001".into(),
					value: b"entry".to_vec(),
					expected_seq: Some(0),
					ttl: None,
				},
				PutOp {
					key: "outbox:o-1:0000000001".into(),
					value: b"event".to_vec(),
					expected_seq: Some(0),
					ttl: None,
				},
			])
			.await
			.unwrap();

		assert_eq!(storage.get_bytes("orders:o-1").await.unwrap().0, b"pending");
		assert_eq!(
			storage.list_keys("outbox:o-1:").await.unwrap(),
			vec!["outbox:o-1:0000000001"]
		);
		assert!(!dir.path().join("batch.journal").exists());
	}

	#[tokio::test]
	async fn test_interrupted_batch_is_replayed_on_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let storage = storage(&dir);
			storage
				.put_bytes("orders:o-1", b"waiting".to_vec(), Some(0), None)
				.await
				.unwrap();
			// The order row from the batch already landed before the crash
			storage
				.put_bytes("orders:o-1", b"pending".to_vec(), Some(1), None)
				.await
				.unwrap();
		}

		// A crash between the order rename and the outbox rename leaves
		// the committed journal behind with the outbox row unwritten
		let entries = vec![
			JournalEntry {
				key: "orders:o-1".into(),
				seq: 2,
				expires_at: 0,
				value: b"pending".to_vec(),
			},
			JournalEntry {
				key: "outbox:o-1:0000000002".into(),
				seq: 1,
				expires_at: 0,
				value: b"event".to_vec(),
			},
		];
		std::fs::write(dir.path().join("batch.journal"), encode_journal(&entries)).unwrap();

		let storage = storage(&dir);
		assert_eq!(
			storage.list_keys("outbox:o-1:").await.unwrap(),
			vec!["outbox:o-1:0000000002"]
		);
		let (bytes, seq) = storage.get_bytes("orders:o-1").await.unwrap();
		assert_eq!(bytes, b"pending");
		assert_eq!(seq, 2);
		assert!(!dir.path().join("batch.journal").exists());
	}

	#[test]
	fn test_journal_round_trip_rejects_truncation() {
		let entries = vec![
			JournalEntry {
				key: "orders:o-1".into(),
				seq: 3,
				expires_at: 1_700_000_000,
				value: b"order".to_vec(),
			},
			JournalEntry {
				key: "outbox:o-1:0000000003".into(),
				seq: 1,
				expires_at: 0,
				value: vec![],
			},
		];
		let encoded = encode_journal(&entries);
		assert_eq!(decode_journal(&encoded).unwrap(), entries);
		assert!(decode_journal(&encoded[..encoded.len() - 1]).is_err());
		assert!(decode_journal(b"JUNK").is_err());
	}

	#[tokio::test]
	async fn test_expired_file_reads_as_absent_and_is_cleaned() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		storage
			.put_bytes(
				"consumer_handled:ev-1",
				b"x".to_vec(),
				None,
				Some(Duration::from_nanos(1)),
			)
			.await
			.unwrap();

		// Sub-second TTLs round down to an expiry in the past
		assert!(matches!(
			storage.get_bytes("consumer_handled:ev-1").await,
			Err(StorageError::NotFound)
		));
		assert!(!storage.exists("consumer_handled:ev-1").await.unwrap());
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
	}
}
