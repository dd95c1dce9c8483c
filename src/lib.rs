//! # calm-cache
//!
//! Anti-stampede caching primitives for async Rust services.
//!
//! calm-cache provides two cooperating layers:
//!
//! - [`CalmCache`]: a wrapper around any [`KeyValueStore`] that defuses
//!   cache stampedes. Entries carry a refresh deadline; when it passes,
//!   exactly one caller is told the entry is missing (and goes off to
//!   recompute it) while everyone else keeps being served the stale
//!   value for a bounded mint period, with an optional grace period
//!   beyond that.
//! - [`ResponseCache`]: a memoizing middleware that serves whole HTTP
//!   responses from any [`KeyValueStore`] (a [`CalmCache`] included),
//!   with fine-grained rules for which requests may hit the cache and
//!   which responses may be stored, plus a [`PageCache`] variant that
//!   honors `Cache-Control: max-age`.
//!
//! Both layers are backend-agnostic: anything that can get, set,
//! set-if-absent and delete byte values with a TTL plugs in through the
//! [`KeyValueStore`] trait. The bundled [`InMemoryStore`] covers tests
//! and single-process deployments.
//!
//! ## Quick Start
//!
//! ```
//! use calm_cache::{CalmCache, CalmCacheConfig, InMemoryStore};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = CalmCacheConfig::new()
//! 	.with_mint_period(10)
//! 	.with_grace_period(60)
//! 	.with_default_ttl(Duration::from_secs(300))
//! 	.with_key_prefix("api");
//! let cache = CalmCache::new(InMemoryStore::new(), config);
//!
//! cache.set("user:42", b"profile", None, None).await.unwrap();
//! assert_eq!(
//! 	cache.get("user:42", None).await.unwrap(),
//! 	Some(b"profile".to_vec())
//! );
//! # });
//! ```

pub mod error;
pub mod http;
pub mod key;
pub mod mint;
pub mod response_cache;
pub mod store;

pub use error::{CacheError, Result};
pub use http::{AuthState, Handler, Middleware, PostRenderCallback, Request, RequestBuilder, Response};
pub use key::{StoreKeyFunc, default_key_func, sha1_key_func};
pub use mint::{
	CalmCache, CalmCacheConfig, Clock, JitterSource, PackedEntry, SystemClock, UniformJitter,
};
pub use response_cache::{
	CachedHandler, HitMissHeader, PageCache, RequestKeyFunc, ResponseCache, ResponseCacheConfig,
};
pub use store::{InMemoryStore, KeyValueStore};
