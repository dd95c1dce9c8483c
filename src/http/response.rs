use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::{HeaderMap, StatusCode};

use crate::error::Result;

/// Exactly-once callback fired after a deferred body is materialized.
///
/// The callback sees the rendered response and may run async work (the
/// response cache stores the snapshot from here). Errors propagate out
/// of [`Response::render`].
pub type PostRenderCallback =
	Box<dyn for<'a> FnOnce(&'a Response) -> BoxFuture<'a, Result<()>> + Send + Sync>;

type BodyProducer = Box<dyn FnOnce() -> Bytes + Send + Sync>;

/// HTTP response representation.
///
/// A response is either fully materialized, streaming (unbounded body,
/// never cacheable), or deferred: status and headers are final but the
/// body is produced later by a single-shot closure, mirroring a
/// templated body that has not been rendered yet.
pub struct Response {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	streaming: bool,
	producer: Option<BodyProducer>,
	post_render: Vec<PostRenderCallback>,
}

impl Response {
	/// Create a new response with the given status code.
	///
	/// # Examples
	///
	/// ```
	/// use calm_cache::Response;
	/// use hyper::StatusCode;
	///
	/// let response = Response::new(StatusCode::NOT_FOUND);
	/// assert_eq!(response.status, StatusCode::NOT_FOUND);
	/// assert!(response.body.is_empty());
	/// ```
	pub fn new(status: StatusCode) -> Self {
		Self {
			status,
			headers: HeaderMap::new(),
			body: Bytes::new(),
			streaming: false,
			producer: None,
			post_render: Vec::new(),
		}
	}

	/// Create a response with HTTP 200 OK status.
	pub fn ok() -> Self {
		Self::new(StatusCode::OK)
	}

	/// Create a streaming response. Its body is unbounded and it is never
	/// eligible for caching.
	pub fn streaming(status: StatusCode) -> Self {
		let mut response = Self::new(status);
		response.streaming = true;
		response
	}

	/// Create a deferred response: headers and status are final, the body
	/// is produced by `producer` when [`render`](Self::render) runs.
	pub fn deferred(
		status: StatusCode,
		producer: impl FnOnce() -> Bytes + Send + Sync + 'static,
	) -> Self {
		let mut response = Self::new(status);
		response.producer = Some(Box::new(producer));
		response
	}

	/// Set the response body.
	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();
		self
	}

	/// Add a header, silently dropping invalid names or values.
	pub fn with_header(mut self, name: &str, value: &str) -> Self {
		if let (Ok(name), Ok(value)) = (
			hyper::header::HeaderName::try_from(name),
			hyper::header::HeaderValue::try_from(value),
		) {
			self.headers.insert(name, value);
		}
		self
	}

	/// Whether the named header is present.
	pub fn has_header(&self, name: &str) -> bool {
		self.headers.contains_key(name)
	}

	/// Whether this response has an unbounded streaming body.
	pub fn is_streaming(&self) -> bool {
		self.streaming
	}

	/// Whether the body is materialized. False only while a deferred
	/// producer is still pending.
	pub fn is_rendered(&self) -> bool {
		self.producer.is_none()
	}

	/// Register a callback to run once the deferred body is materialized.
	///
	/// Callbacks fire in registration order, exactly once, from
	/// [`render`](Self::render). On an already-rendered response the
	/// callback runs on the next `render` call, which is a no-op for the
	/// body.
	pub fn add_post_render_callback(&mut self, callback: PostRenderCallback) {
		self.post_render.push(callback);
	}

	/// Materialize a deferred body and fire the post-render callbacks.
	///
	/// Idempotent: a second call (or a call on a never-deferred response
	/// with no pending callbacks) does nothing.
	pub async fn render(&mut self) -> Result<()> {
		if let Some(producer) = self.producer.take() {
			self.body = producer();
		}
		let callbacks = std::mem::take(&mut self.post_render);
		for callback in callbacks {
			callback(&*self).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn test_plain_response_is_rendered() {
		let response = Response::ok().with_body("hello");
		assert!(response.is_rendered());
		assert!(!response.is_streaming());
		assert_eq!(response.body, Bytes::from("hello"));
	}

	#[tokio::test]
	async fn test_deferred_render_materializes_once() {
		let mut response = Response::deferred(StatusCode::OK, || Bytes::from("rendered"));
		assert!(!response.is_rendered());
		assert!(response.body.is_empty());

		response.render().await.unwrap();
		assert!(response.is_rendered());
		assert_eq!(response.body, Bytes::from("rendered"));

		// Second render is a no-op.
		response.render().await.unwrap();
		assert_eq!(response.body, Bytes::from("rendered"));
	}

	#[tokio::test]
	async fn test_post_render_callback_fires_exactly_once() {
		let calls = Arc::new(AtomicUsize::new(0));
		let seen = calls.clone();

		let mut response = Response::deferred(StatusCode::OK, || Bytes::from("body"));
		response.add_post_render_callback(Box::new(move |rendered| {
			Box::pin(async move {
				assert_eq!(rendered.body, Bytes::from("body"));
				seen.fetch_add(1, Ordering::SeqCst);
				Ok(())
			})
		}));

		response.render().await.unwrap();
		response.render().await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_header_helpers() {
		let response = Response::ok().with_header("Vary", "*");
		assert!(response.has_header("Vary"));
		assert!(response.has_header("vary"));
		assert!(!response.has_header("Set-Cookie"));
	}
}
