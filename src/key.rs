//! Store-level key functions.
//!
//! Keys handed to a backing store are namespaced as
//! `prefix:version:key`. [`sha1_key_func`] additionally hashes the
//! caller-supplied part so the final key has a predictable length and
//! never exceeds engine limits (memcached caps keys at 250 bytes).

use sha1::{Digest, Sha1};

/// Signature of a store-level key function: `(key, prefix, version)`.
pub type StoreKeyFunc = fn(&str, &str, &str) -> String;

/// Default key function: joins prefix, version and the raw key with `:`.
///
/// # Examples
///
/// ```
/// use calm_cache::default_key_func;
///
/// assert_eq!(default_key_func("k1", "app", "2"), "app:2:k1");
/// ```
pub fn default_key_func(key: &str, key_prefix: &str, version: &str) -> String {
	format!("{}:{}:{}", key_prefix, version, key)
}

/// Key function hashing the caller-supplied key with SHA-1.
///
/// The key is UTF-8 encoded before hashing, so the same logical key
/// always produces the same digest regardless of how it was assembled.
///
/// # Examples
///
/// ```
/// use calm_cache::sha1_key_func;
///
/// assert_eq!(
/// 	sha1_key_func("original key value", "prefix", "v1"),
/// 	"prefix:v1:905d4140b8d64409c84b8c442d26707be9f95df2"
/// );
/// ```
pub fn sha1_key_func(key: &str, key_prefix: &str, version: &str) -> String {
	let digest = Sha1::digest(key.as_bytes());
	format!("{}:{}:{}", key_prefix, version, hex::encode(digest))
}
