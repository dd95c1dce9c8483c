use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::http::{Request, Response};

/// Handler trait for processing requests.
///
/// This is the core abstraction: a handler receives a request and
/// produces a response or an error.
#[async_trait]
pub trait Handler: Send + Sync {
	/// Handles a request and produces a response.
	///
	/// # Errors
	///
	/// Returns an error if the request cannot be processed.
	async fn handle(&self, request: Request) -> Result<Response>;
}

/// Blanket implementation for `Arc<T>` where T: Handler, enabling shared
/// ownership of handlers across threads.
#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
	async fn handle(&self, request: Request) -> Result<Response> {
		(**self).handle(request).await
	}
}

/// Middleware trait for request/response processing.
///
/// Middleware wraps handlers by composition: it may answer a request
/// itself (a cache hit does exactly that) or delegate to `next`.
#[async_trait]
pub trait Middleware: Send + Sync {
	/// Processes a request through this middleware.
	///
	/// # Errors
	///
	/// Returns an error if the middleware or the next handler fails.
	async fn process(&self, request: Request, next: Arc<dyn Handler>) -> Result<Response>;
}
