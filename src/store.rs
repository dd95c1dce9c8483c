//! Key-value store collaborator interface and the in-memory backend.
//!
//! The calm cache is a decision layer over an injected store; anything
//! that can get, set, set-if-absent and delete byte values with a TTL can
//! sit underneath it. [`InMemoryStore`] is the bundled backend used for
//! tests and single-process deployments; memcached-like engines are
//! external collaborators and plug in through the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

use crate::error::Result;

/// Interface the wrapping caches require from a backing store.
///
/// Values are opaque bytes; serialization belongs to the layers above.
/// A miss is `Ok(None)`. Implementations must not retry internally:
/// failures propagate to the caller uninterpreted.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
	/// Fetch the value stored under `key`, if any.
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

	/// Store `value` under `key` unconditionally.
	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

	/// Store `value` under `key` only if the key is absent. Returns whether
	/// the insert happened. This is the store's atomic set-if-absent
	/// primitive.
	async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

	/// Remove `key`. Removing an absent key is not an error.
	async fn delete(&self, key: &str) -> Result<()>;

	/// Whether `key` currently holds an unexpired value.
	async fn has_key(&self, key: &str) -> Result<bool>;

	/// Drop every entry.
	async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		(**self).get(key).await
	}

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
		(**self).set(key, value, ttl).await
	}

	async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
		(**self).add(key, value, ttl).await
	}

	async fn delete(&self, key: &str) -> Result<()> {
		(**self).delete(key).await
	}

	async fn has_key(&self, key: &str) -> Result<bool> {
		(**self).has_key(key).await
	}

	async fn clear(&self) -> Result<()> {
		(**self).clear().await
	}
}

/// A stored value with its absolute expiry.
#[derive(Debug, Clone)]
struct StoredEntry {
	value: Vec<u8>,
	expires_at: Option<SystemTime>,
}

impl StoredEntry {
	fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
		let expires_at = ttl.map(|d| SystemTime::now() + d);
		Self { value, expires_at }
	}

	fn is_expired(&self) -> bool {
		match self.expires_at {
			Some(expires_at) => SystemTime::now() > expires_at,
			None => false,
		}
	}
}

/// In-memory key-value store.
///
/// Expired entries are treated as absent on read and reaped lazily;
/// [`cleanup_expired`](InMemoryStore::cleanup_expired) sweeps them out
/// eagerly.
///
/// # Examples
///
/// ```
/// use calm_cache::{InMemoryStore, KeyValueStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::new();
/// store.set("key", b"value".to_vec(), None).await.unwrap();
/// assert_eq!(store.get("key").await.unwrap(), Some(b"value".to_vec()));
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
	entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl InMemoryStore {
	/// Create an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Remove every expired entry.
	pub async fn cleanup_expired(&self) {
		let mut entries = self.entries.write().await;
		entries.retain(|_, entry| !entry.is_expired());
	}

	/// Number of live (unexpired) entries.
	pub async fn len(&self) -> usize {
		let entries = self.entries.read().await;
		entries.values().filter(|e| !e.is_expired()).count()
	}

	/// Whether the store holds no live entries.
	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		let entries = self.entries.read().await;
		match entries.get(key) {
			Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
			_ => Ok(None),
		}
	}

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
		let mut entries = self.entries.write().await;
		entries.insert(key.to_string(), StoredEntry::new(value, ttl));
		Ok(())
	}

	async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
		let mut entries = self.entries.write().await;
		match entries.get(key) {
			Some(existing) if !existing.is_expired() => Ok(false),
			_ => {
				entries.insert(key.to_string(), StoredEntry::new(value, ttl));
				Ok(true)
			}
		}
	}

	async fn delete(&self, key: &str) -> Result<()> {
		let mut entries = self.entries.write().await;
		entries.remove(key);
		Ok(())
	}

	async fn has_key(&self, key: &str) -> Result<bool> {
		let entries = self.entries.read().await;
		Ok(matches!(entries.get(key), Some(entry) if !entry.is_expired()))
	}

	async fn clear(&self) -> Result<()> {
		let mut entries = self.entries.write().await;
		entries.clear();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_set_get_roundtrip() {
		let store = InMemoryStore::new();
		store.set("k1", b"v1".to_vec(), None).await.unwrap();
		assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));
		assert_eq!(store.get("missing").await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_add_only_when_absent() {
		let store = InMemoryStore::new();
		assert!(store.add("k1", b"first".to_vec(), None).await.unwrap());
		assert!(!store.add("k1", b"second".to_vec(), None).await.unwrap());
		assert_eq!(store.get("k1").await.unwrap(), Some(b"first".to_vec()));
	}

	#[tokio::test]
	async fn test_add_replaces_expired_entry() {
		let store = InMemoryStore::new();
		store
			.set("k1", b"old".to_vec(), Some(Duration::from_millis(10)))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(store.add("k1", b"new".to_vec(), None).await.unwrap());
		assert_eq!(store.get("k1").await.unwrap(), Some(b"new".to_vec()));
	}

	#[tokio::test]
	async fn test_ttl_expiry() {
		let store = InMemoryStore::new();
		store
			.set("k1", b"v1".to_vec(), Some(Duration::from_millis(10)))
			.await
			.unwrap();
		assert!(store.has_key("k1").await.unwrap());
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(store.get("k1").await.unwrap(), None);
		assert!(!store.has_key("k1").await.unwrap());
	}

	#[tokio::test]
	async fn test_delete_and_clear() {
		let store = InMemoryStore::new();
		store.set("k1", b"v1".to_vec(), None).await.unwrap();
		store.set("k2", b"v2".to_vec(), None).await.unwrap();
		store.delete("k1").await.unwrap();
		assert!(!store.has_key("k1").await.unwrap());
		assert!(store.has_key("k2").await.unwrap());
		store.clear().await.unwrap();
		assert!(store.is_empty().await);
	}

	#[tokio::test]
	async fn test_cleanup_expired() {
		let store = InMemoryStore::new();
		store
			.set("short", b"v".to_vec(), Some(Duration::from_millis(10)))
			.await
			.unwrap();
		store.set("long", b"v".to_vec(), None).await.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		store.cleanup_expired().await;
		assert_eq!(store.len().await, 1);
	}
}
