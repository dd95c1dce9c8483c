//! End-to-end exercises of the memoizing response cache, on its own and
//! layered over a mint/grace cache.

use calm_cache::{
	AuthState, CacheError, CalmCache, CalmCacheConfig, Handler, InMemoryStore, KeyValueStore,
	Middleware, Request, Response, ResponseCache, ResponseCacheConfig, Result,
};
use bytes::Bytes;
use hyper::{Method, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn get(path: &str) -> Request {
	Request::builder()
		.method(Method::GET)
		.uri(path)
		.header("host", "testserver")
		.build()
		.unwrap()
}

/// Handler returning a unique body per invocation, so repeated identical
/// bodies prove a cache hit.
struct CountingHandler {
	calls: AtomicUsize,
}

impl CountingHandler {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			calls: AtomicUsize::new(0),
		})
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl Handler for CountingHandler {
	async fn handle(&self, _request: Request) -> Result<Response> {
		let n = self.calls.fetch_add(1, Ordering::SeqCst);
		Ok(Response::ok().with_body(format!("body-{n}")))
	}
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
	let config = ResponseCacheConfig::new(Duration::from_secs(30)).with_key_prefix("t");
	let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let handler = CountingHandler::new();
	let wrapped = cache.wrap(handler.clone());

	let first = wrapped.handle(get("/page/")).await.unwrap();
	let second = wrapped.handle(get("/page/")).await.unwrap();

	assert_eq!(first.headers.get("x-cache").unwrap(), "Miss");
	assert_eq!(second.headers.get("x-cache").unwrap(), "Hit");
	assert_eq!(first.body, second.body);
	assert_eq!(first.status, StatusCode::OK);
	assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_distinct_urls_are_cached_separately() {
	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let handler = CountingHandler::new();
	let wrapped = cache.wrap(handler.clone());

	let one = wrapped.handle(get("/url1/?k1=v1")).await.unwrap();
	let two = wrapped.handle(get("/url1/?k1=other")).await.unwrap();
	let three = wrapped.handle(get("/url2/")).await.unwrap();

	assert_ne!(one.body, two.body);
	assert_ne!(one.body, three.body);
	assert_eq!(handler.calls(), 3);

	// Each URL replays independently.
	let replay = wrapped.handle(get("/url1/?k1=v1")).await.unwrap();
	assert_eq!(replay.body, one.body);
	assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
	let config = ResponseCacheConfig::new(Duration::from_millis(40));
	let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let handler = CountingHandler::new();
	let wrapped = cache.wrap(handler.clone());

	let first = wrapped.handle(get("/volatile/")).await.unwrap();
	tokio::time::sleep(Duration::from_millis(80)).await;
	let second = wrapped.handle(get("/volatile/")).await.unwrap();

	assert_ne!(first.body, second.body);
	assert_eq!(second.headers.get("x-cache").unwrap(), "Miss");
	assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_authenticated_requests_bypass_by_default() {
	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let handler = CountingHandler::new();
	let wrapped = cache.wrap(handler.clone());

	let authed = || {
		Request::builder()
			.uri("/profile/")
			.header("host", "testserver")
			.auth(AuthState::authenticated("u1"))
			.build()
			.unwrap()
	};

	let first = wrapped.handle(authed()).await.unwrap();
	let second = wrapped.handle(authed()).await.unwrap();

	assert!(!first.has_header("x-cache"));
	assert_ne!(first.body, second.body);
	assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_usable_through_middleware_trait() {
	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let middleware: Arc<dyn Middleware> =
		Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let handler = CountingHandler::new();

	let first = middleware
		.process(get("/mw/"), handler.clone())
		.await
		.unwrap();
	let second = middleware
		.process(get("/mw/"), handler.clone())
		.await
		.unwrap();

	assert_eq!(first.body, second.body);
	assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_layered_over_minted_cache() {
	// The response cache neither knows nor cares that its store is a
	// mint/grace wrapper; snapshots ride through packing untouched.
	let calm = CalmCache::new(
		InMemoryStore::new(),
		CalmCacheConfig::new()
			.with_mint_period(10)
			.with_grace_period(60)
			.with_key_prefix("pages"),
	);
	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let cache = Arc::new(ResponseCache::new(calm, config));
	let handler = CountingHandler::new();
	let wrapped = cache.wrap(handler.clone());

	let first = wrapped.handle(get("/layered/")).await.unwrap();
	let second = wrapped.handle(get("/layered/")).await.unwrap();

	assert_eq!(first.body, second.body);
	assert_eq!(second.headers.get("x-cache").unwrap(), "Hit");
	assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_deferred_body_replays_after_render() {
	struct TemplateHandler;

	#[async_trait::async_trait]
	impl Handler for TemplateHandler {
		async fn handle(&self, _request: Request) -> Result<Response> {
			Ok(Response::deferred(StatusCode::OK, || {
				Bytes::from("late-rendered")
			}))
		}
	}

	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let wrapped = cache.wrap(Arc::new(TemplateHandler));

	// Nothing is stored until the body materializes.
	let mut first = wrapped.handle(get("/template/")).await.unwrap();
	first.render().await.unwrap();

	let second = wrapped.handle(get("/template/")).await.unwrap();
	assert!(second.is_rendered());
	assert_eq!(second.body, Bytes::from("late-rendered"));
	assert_eq!(second.headers.get("x-cache").unwrap(), "Hit");
}

#[tokio::test]
async fn test_store_failure_surfaces_instead_of_bypassing() {
	/// Store whose every operation fails, standing in for an unreachable
	/// backend.
	struct FailingStore;

	#[async_trait::async_trait]
	impl KeyValueStore for FailingStore {
		async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
			Err(CacheError::store("connection refused"))
		}

		async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
			Err(CacheError::store("connection refused"))
		}

		async fn add(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<bool> {
			Err(CacheError::store("connection refused"))
		}

		async fn delete(&self, _key: &str) -> Result<()> {
			Err(CacheError::store("connection refused"))
		}

		async fn has_key(&self, _key: &str) -> Result<bool> {
			Err(CacheError::store("connection refused"))
		}

		async fn clear(&self) -> Result<()> {
			Err(CacheError::store("connection refused"))
		}
	}

	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let cache = Arc::new(ResponseCache::new(FailingStore, config));
	let handler = CountingHandler::new();
	let wrapped = cache.wrap(handler.clone());

	// A store outage is visible, not silently treated as a miss; the
	// handler is never reached.
	let err = match wrapped.handle(get("/outage/")).await {
		Err(err) => err,
		Ok(_) => panic!("store failure should surface"),
	};
	assert!(matches!(err, CacheError::Store { .. }));
	assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_error_responses_are_not_cached() {
	struct FlakyHandler {
		calls: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl Handler for FlakyHandler {
		async fn handle(&self, _request: Request) -> Result<Response> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			if n == 0 {
				Ok(Response::new(StatusCode::INTERNAL_SERVER_ERROR).with_body("boom"))
			} else {
				Ok(Response::ok().with_body("recovered"))
			}
		}
	}

	let config = ResponseCacheConfig::new(Duration::from_secs(30));
	let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
	let wrapped = cache.wrap(Arc::new(FlakyHandler {
		calls: AtomicUsize::new(0),
	}));

	let first = wrapped.handle(get("/flaky/")).await.unwrap();
	assert_eq!(first.status, StatusCode::INTERNAL_SERVER_ERROR);

	// The failure was not memoized; recovery shows through.
	let second = wrapped.handle(get("/flaky/")).await.unwrap();
	assert_eq!(second.status, StatusCode::OK);
	assert_eq!(second.body, Bytes::from("recovered"));
}
