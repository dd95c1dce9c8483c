//! Mint/grace cache wrapper.
//!
//! [`CalmCache`] keeps traffic calm by packing every stored value with a
//! logical expiry and a refreshing flag. When an entry goes stale, one
//! reader claims the refresh (and is told "miss" so it recomputes) while
//! everyone else keeps reading the stale value. After the mint window a
//! configurable grace window serves the stale value exactly once more,
//! then evicts.
//!
//! The wrapper holds no shared mutable state of its own; the injected
//! [`KeyValueStore`] is the single synchronization point. The refresh
//! claim is deliberately check-then-act: concurrent readers may race the
//! claiming write and a few extra recomputations can happen. The goal is
//! calm, not perfect.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use crate::error::Result;
use crate::key::{StoreKeyFunc, default_key_func};
use crate::store::KeyValueStore;

/// Time source, injectable so tests can travel in time.
pub trait Clock: Send + Sync {
	/// Seconds since the Unix epoch, fractional.
	fn now(&self) -> f64;
}

/// Wall-clock time. The production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> f64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs_f64())
			.unwrap_or(0.0)
	}
}

/// Randomness source for TTL jitter, injectable for deterministic tests.
pub trait JitterSource: Send + Sync {
	/// A value in `[0, max]`.
	fn jitter(&self, max: u64) -> u64;
}

/// Uniformly distributed jitter. The production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformJitter;

impl JitterSource for UniformJitter {
	fn jitter(&self, max: u64) -> u64 {
		use rand::Rng;
		rand::thread_rng().gen_range(0..=max)
	}
}

/// Configuration for [`CalmCache`]. Immutable once the cache is built.
#[derive(Clone)]
pub struct CalmCacheConfig {
	/// Seconds a stale entry may be served while one caller refreshes it.
	pub mint_period: u64,
	/// Extra seconds a stale entry is served once, without re-claiming,
	/// before hard eviction.
	pub grace_period: u64,
	/// Upper bound of the randomized TTL spread. 0 disables jitter.
	pub jitter: u64,
	/// TTL applied when an operation does not supply one.
	pub default_ttl: Duration,
	/// Prefix joined into every store key.
	pub key_prefix: String,
	/// Version tag joined into every store key unless overridden per call.
	pub version: String,
	/// Store-level key function; see [`crate::sha1_key_func`] for stores
	/// with key-length limits.
	pub key_func: StoreKeyFunc,
}

impl CalmCacheConfig {
	/// Configuration with packing disabled: no mint, no grace, no jitter.
	pub fn new() -> Self {
		Self {
			mint_period: 0,
			grace_period: 0,
			jitter: 0,
			default_ttl: Duration::from_secs(300),
			key_prefix: String::new(),
			version: "1".to_string(),
			key_func: default_key_func,
		}
	}

	/// Set the mint period in seconds.
	pub fn with_mint_period(mut self, secs: u64) -> Self {
		self.mint_period = secs;
		self
	}

	/// Set the grace period in seconds.
	pub fn with_grace_period(mut self, secs: u64) -> Self {
		self.grace_period = secs;
		self
	}

	/// Set the maximum TTL jitter in seconds.
	pub fn with_jitter(mut self, secs: u64) -> Self {
		self.jitter = secs;
		self
	}

	/// Set the default TTL.
	pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
		self.default_ttl = ttl;
		self
	}

	/// Set the key prefix.
	pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.key_prefix = prefix.into();
		self
	}

	/// Set the default version tag.
	pub fn with_version(mut self, version: impl Into<String>) -> Self {
		self.version = version.into();
		self
	}

	/// Replace the store-level key function.
	pub fn with_key_func(mut self, key_func: StoreKeyFunc) -> Self {
		self.key_func = key_func;
		self
	}
}

impl Default for CalmCacheConfig {
	fn default() -> Self {
		Self::new()
	}
}

/// The wrapped form of a value as written to the underlying store.
///
/// `refresh_at` is `write_time + ttl + jitter`; `refreshing` is true
/// while one caller holds the refresh claim. When packing is disabled
/// (both mint and grace periods are 0) values are stored bare, with no
/// wrapper at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedEntry {
	pub value: Vec<u8>,
	pub refresh_at: f64,
	pub refreshing: bool,
}

/// Mint/grace cache over an injected key-value store.
///
/// # Examples
///
/// ```
/// use calm_cache::{CalmCache, CalmCacheConfig, InMemoryStore};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let config = CalmCacheConfig::new()
/// 	.with_mint_period(10)
/// 	.with_grace_period(120)
/// 	.with_jitter(10);
/// let cache = CalmCache::new(InMemoryStore::new(), config);
///
/// cache
/// 	.set("greeting", b"hello", Some(Duration::from_secs(60)), None)
/// 	.await
/// 	.unwrap();
/// assert_eq!(
/// 	cache.get("greeting", None).await.unwrap(),
/// 	Some(b"hello".to_vec())
/// );
/// # });
/// ```
pub struct CalmCache<S: KeyValueStore> {
	store: S,
	config: CalmCacheConfig,
	clock: Arc<dyn Clock>,
	jitter_source: Arc<dyn JitterSource>,
}

impl<S: KeyValueStore> CalmCache<S> {
	/// Wrap `store` with the given configuration, using the wall clock and
	/// uniform random jitter.
	pub fn new(store: S, config: CalmCacheConfig) -> Self {
		Self {
			store,
			config,
			clock: Arc::new(SystemClock),
			jitter_source: Arc::new(UniformJitter),
		}
	}

	/// Replace the time source.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	/// Replace the jitter source.
	pub fn with_jitter_source(mut self, jitter_source: Arc<dyn JitterSource>) -> Self {
		self.jitter_source = jitter_source;
		self
	}

	/// The wrapped store.
	pub fn store(&self) -> &S {
		&self.store
	}

	/// The configuration this cache was built with.
	pub fn config(&self) -> &CalmCacheConfig {
		&self.config
	}

	/// Whether values are packed with staleness metadata at all.
	fn packing_enabled(&self) -> bool {
		self.config.mint_period > 0 || self.config.grace_period > 0
	}

	fn jitter(&self) -> u64 {
		if self.config.jitter == 0 {
			return 0;
		}
		self.jitter_source.jitter(self.config.jitter)
	}

	/// Transform a caller key into the namespaced store key.
	pub fn make_key(&self, key: &str, version: Option<&str>) -> String {
		let version = version.unwrap_or(&self.config.version);
		(self.config.key_func)(key, &self.config.key_prefix, version)
	}

	fn pack(&self, value: &[u8], ttl: Duration, refreshing: bool) -> Result<Vec<u8>> {
		if !self.packing_enabled() {
			return Ok(value.to_vec());
		}
		let entry = PackedEntry {
			value: value.to_vec(),
			refresh_at: self.clock.now() + ttl.as_secs_f64() + self.jitter() as f64,
			refreshing,
		};
		Ok(serde_json::to_vec(&entry)?)
	}

	fn unpack(&self, raw: Vec<u8>) -> Result<PackedEntry> {
		if !self.packing_enabled() {
			// Bare value: never stale, never claims a refresh.
			return Ok(PackedEntry {
				value: raw,
				refresh_at: 0.0,
				refreshing: true,
			});
		}
		Ok(serde_json::from_slice(&raw)?)
	}

	/// TTL handed to the underlying store. Always covers the full logical
	/// lifetime: `ttl + mint + grace + jitter`, so the wrapper stays the
	/// single source of truth for staleness while the entry exists.
	fn real_ttl(&self, ttl: Duration) -> Duration {
		let padding = self.config.mint_period + self.config.grace_period + self.jitter();
		ttl + Duration::from_secs(padding)
	}

	/// Store `value` only if `key` is absent. Returns whether the store
	/// actually inserted.
	pub async fn add(
		&self,
		key: &str,
		value: &[u8],
		ttl: Option<Duration>,
		version: Option<&str>,
	) -> Result<bool> {
		let cache_key = self.make_key(key, version);
		let ttl = ttl.unwrap_or(self.config.default_ttl);
		let packed = self.pack(value, ttl, false)?;
		self.store.add(&cache_key, packed, Some(self.real_ttl(ttl))).await
	}

	/// Store `value` unconditionally.
	pub async fn set(
		&self,
		key: &str,
		value: &[u8],
		ttl: Option<Duration>,
		version: Option<&str>,
	) -> Result<()> {
		self.store_packed(key, value, ttl, version, false).await
	}

	async fn store_packed(
		&self,
		key: &str,
		value: &[u8],
		ttl: Option<Duration>,
		version: Option<&str>,
		refreshing: bool,
	) -> Result<()> {
		let cache_key = self.make_key(key, version);
		let ttl = ttl.unwrap_or(self.config.default_ttl);
		let packed = self.pack(value, ttl, refreshing)?;
		self.store.set(&cache_key, packed, Some(self.real_ttl(ttl))).await
	}

	/// Fetch `key`, applying the mint/grace staleness rules.
	///
	/// Returns `Ok(None)` on a true miss and, crucially, on the read that
	/// claims a refresh: that caller is expected to recompute and `set` a
	/// fresh value while everyone else keeps reading stale.
	pub async fn get(&self, key: &str, version: Option<&str>) -> Result<Option<Vec<u8>>> {
		let cache_key = self.make_key(key, version);
		let raw = match self.store.get(&cache_key).await? {
			Some(raw) => raw,
			None => {
				trace!(key, "miss");
				return Ok(None);
			}
		};
		let entry = self.unpack(raw)?;
		let now = self.clock.now();

		if now > entry.refresh_at + self.config.mint_period as f64 && self.config.grace_period > 0 {
			// Past the mint window with grace configured: serve the stale
			// value one last time and evict, so the next reader recomputes.
			debug!(key, "grace expired, serving stale once and evicting");
			self.store.delete(&cache_key).await?;
			return Ok(Some(entry.value));
		}

		if now > entry.refresh_at && !entry.refreshing {
			// Stale inside the mint window and unclaimed: claim the refresh
			// slot for this caller and report a miss so it recomputes.
			// Intentionally not atomic; see the module docs.
			debug!(key, "stale, claiming refresh");
			self.store_packed(
				key,
				&entry.value,
				Some(Duration::from_secs(self.config.mint_period)),
				version,
				true,
			)
			.await?;
			return Ok(None);
		}

		trace!(key, "hit");
		Ok(Some(entry.value))
	}

	/// Remove `key`.
	pub async fn delete(&self, key: &str, version: Option<&str>) -> Result<()> {
		let cache_key = self.make_key(key, version);
		self.store.delete(&cache_key).await
	}

	/// Whether `key` currently exists in the underlying store.
	pub async fn has_key(&self, key: &str, version: Option<&str>) -> Result<bool> {
		let cache_key = self.make_key(key, version);
		self.store.has_key(&cache_key).await
	}

	/// Drop every entry from the underlying store.
	pub async fn clear(&self) -> Result<()> {
		self.store.clear().await
	}
}

/// A `CalmCache` is itself a [`KeyValueStore`], so memoization layers can
/// sit on top of either a plain store or a minted one.
#[async_trait::async_trait]
impl<S: KeyValueStore> KeyValueStore for CalmCache<S> {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		CalmCache::get(self, key, None).await
	}

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
		CalmCache::set(self, key, &value, ttl, None).await
	}

	async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
		CalmCache::add(self, key, &value, ttl, None).await
	}

	async fn delete(&self, key: &str) -> Result<()> {
		CalmCache::delete(self, key, None).await
	}

	async fn has_key(&self, key: &str) -> Result<bool> {
		CalmCache::has_key(self, key, None).await
	}

	async fn clear(&self) -> Result<()> {
		CalmCache::clear(self).await
	}
}
