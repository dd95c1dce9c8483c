//! Error taxonomy for the caching layers.
//!
//! A cache miss is never an error: every lookup returns `Ok(None)` for an
//! absent key. Errors are reserved for failures of the underlying store
//! (propagated unchanged, never retried or masked) and for invalid
//! configuration detected at construction time.

use thiserror::Error;

/// Errors surfaced by the calm cache and the response cache.
#[derive(Debug, Error)]
pub enum CacheError {
	/// The underlying key-value store failed. The message carries whatever
	/// the store reported; no interpretation or retry happens on the way up.
	#[error("cache store error: {message}")]
	Store { message: String },

	/// Invalid configuration rejected at construction time.
	#[error("invalid cache configuration: {0}")]
	Misconfigured(String),

	/// A stored entry or snapshot could not be encoded or decoded.
	#[error("cache serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl CacheError {
	/// Wrap an arbitrary store failure.
	pub fn store(message: impl Into<String>) -> Self {
		Self::Store {
			message: message.into(),
		}
	}
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
