//! Conditional response memoization.
//!
//! [`ResponseCache`] wraps a [`Handler`] and caches its responses in any
//! [`KeyValueStore`] (including a [`crate::CalmCache`]), keyed by a
//! normalized fingerprint of the request. Fine-grained rules decide when
//! a request may read from the cache ([`should_fetch`]) and when a
//! response may be stored ([`should_store`]); cached and fresh responses
//! are annotated with a configurable hit/miss header.
//!
//! [`should_fetch`]: ResponseCache::should_fetch
//! [`should_store`]: ResponseCache::should_store

use hyper::header::{CACHE_CONTROL, EXPIRES, HeaderName, HeaderValue, LAST_MODIFIED};
use hyper::{Method, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::http::{Handler, Middleware, Request, Response};
use crate::store::KeyValueStore;

/// Header triple announcing cache hits and misses to clients.
#[derive(Clone, Debug)]
pub struct HitMissHeader {
	pub name: HeaderName,
	pub hit: HeaderValue,
	pub miss: HeaderValue,
}

impl Default for HitMissHeader {
	fn default() -> Self {
		Self {
			name: HeaderName::from_static("x-cache"),
			hit: HeaderValue::from_static("Hit"),
			miss: HeaderValue::from_static("Miss"),
		}
	}
}

/// Custom key derivation: returning `None` forces a cache bypass for the
/// request, regardless of every other rule.
pub type RequestKeyFunc = dyn Fn(&Request) -> Option<String> + Send + Sync;

/// Configuration for [`ResponseCache`]. Immutable once the cache is
/// built.
pub struct ResponseCacheConfig {
	/// TTL for stored responses.
	pub ttl: Duration,
	/// String prepended to every derived key.
	pub key_prefix: String,
	/// Request methods eligible for caching.
	pub methods: Vec<Method>,
	/// Response status codes eligible for storage.
	pub codes: Vec<u16>,
	/// Serve/store only for unauthenticated requests.
	pub anonymous_only: bool,
	/// Cookie policy selector: `false` tolerates only the cookies listed
	/// in `excluded_cookies` (whitelist); `true` caches despite cookies
	/// except those listed (blacklist).
	pub cache_cookies: bool,
	/// Cookie names forming the white/blacklist.
	pub excluded_cookies: HashSet<String>,
	/// Response headers whose presence disqualifies storage.
	pub nocache_response_headers: Vec<HeaderName>,
	/// Request header/pattern pairs disqualifying a cache fetch. Patterns
	/// use regex search semantics, not full match.
	pub nocache_request_headers: Vec<(HeaderName, Regex)>,
	/// Include the scheme segment in derived keys.
	pub include_scheme: bool,
	/// Include the (lowercased) host segment in derived keys.
	pub include_host: bool,
	/// Hit/miss annotation header; `None` disables annotation.
	pub hit_miss_header: Option<HitMissHeader>,
}

impl ResponseCacheConfig {
	/// Defaults: GET only, 200 only, anonymous only, whitelist cookie
	/// policy with an empty whitelist, `Set-Cookie`/`Vary` disqualify
	/// storage, scheme and host in the key, `X-Cache: Hit/Miss`.
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			key_prefix: String::new(),
			methods: vec![Method::GET],
			codes: vec![200],
			anonymous_only: true,
			cache_cookies: false,
			excluded_cookies: HashSet::new(),
			nocache_response_headers: vec![
				HeaderName::from_static("set-cookie"),
				HeaderName::from_static("vary"),
			],
			nocache_request_headers: Vec::new(),
			include_scheme: true,
			include_host: true,
			hit_miss_header: Some(HitMissHeader::default()),
		}
	}

	/// Set the key prefix.
	pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.key_prefix = prefix.into();
		self
	}

	/// Replace the cacheable method set.
	pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
		self.methods = methods;
		self
	}

	/// Replace the cacheable status code set.
	pub fn with_codes(mut self, codes: Vec<u16>) -> Self {
		self.codes = codes;
		self
	}

	/// Allow caching for authenticated principals too.
	pub fn anonymous_only(mut self, anonymous_only: bool) -> Self {
		self.anonymous_only = anonymous_only;
		self
	}

	/// Switch between whitelist (`false`) and blacklist (`true`) cookie
	/// policies.
	pub fn cache_cookies(mut self, cache_cookies: bool) -> Self {
		self.cache_cookies = cache_cookies;
		self
	}

	/// Replace the cookie white/blacklist.
	pub fn with_excluded_cookies(mut self, cookies: impl IntoIterator<Item = String>) -> Self {
		self.excluded_cookies = cookies.into_iter().collect();
		self
	}

	/// Replace the set of response headers disqualifying storage.
	///
	/// # Errors
	///
	/// Fails fast on an invalid header name.
	pub fn with_nocache_response_headers(mut self, names: &[&str]) -> Result<Self> {
		self.nocache_response_headers = names
			.iter()
			.map(|name| {
				HeaderName::try_from(*name).map_err(|e| {
					CacheError::Misconfigured(format!("invalid response header name {name:?}: {e}"))
				})
			})
			.collect::<Result<_>>()?;
		Ok(self)
	}

	/// Add a request header exclusion rule: requests whose `name` header
	/// value matches `pattern` (regex search) bypass the cache.
	///
	/// # Errors
	///
	/// Fails fast on an invalid header name or pattern.
	pub fn with_nocache_request_header(mut self, name: &str, pattern: &str) -> Result<Self> {
		let name = HeaderName::try_from(name).map_err(|e| {
			CacheError::Misconfigured(format!("invalid request header name {name:?}: {e}"))
		})?;
		let pattern = Regex::new(pattern)
			.map_err(|e| CacheError::Misconfigured(format!("invalid header pattern: {e}")))?;
		self.nocache_request_headers.push((name, pattern));
		Ok(self)
	}

	/// Drop or omit key segments.
	pub fn include_scheme(mut self, include: bool) -> Self {
		self.include_scheme = include;
		self
	}

	/// Drop or omit the host key segment.
	pub fn include_host(mut self, include: bool) -> Self {
		self.include_host = include;
		self
	}

	/// Replace the hit/miss annotation header.
	///
	/// # Errors
	///
	/// Fails fast on an invalid header name or value.
	pub fn with_hit_miss_header(mut self, name: &str, hit: &str, miss: &str) -> Result<Self> {
		let name = HeaderName::try_from(name).map_err(|e| {
			CacheError::Misconfigured(format!("invalid hit/miss header name {name:?}: {e}"))
		})?;
		let hit = HeaderValue::try_from(hit)
			.map_err(|e| CacheError::Misconfigured(format!("invalid hit value: {e}")))?;
		let miss = HeaderValue::try_from(miss)
			.map_err(|e| CacheError::Misconfigured(format!("invalid miss value: {e}")))?;
		self.hit_miss_header = Some(HitMissHeader { name, hit, miss });
		Ok(self)
	}

	/// Disable hit/miss annotation entirely.
	pub fn without_hit_miss_header(mut self) -> Self {
		self.hit_miss_header = None;
		self
	}
}

/// Serializable snapshot of a response, as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
	status: u16,
	headers: Vec<(String, String)>,
	body: Vec<u8>,
}

impl CachedResponse {
	fn from_response(response: &Response) -> Self {
		let headers = response
			.headers
			.iter()
			.filter_map(|(name, value)| {
				value
					.to_str()
					.ok()
					.map(|v| (name.as_str().to_string(), v.to_string()))
			})
			.collect();
		Self {
			status: response.status.as_u16(),
			headers,
			body: response.body.to_vec(),
		}
	}

	fn into_response(self) -> Response {
		let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
		let mut response = Response::new(status).with_body(self.body);
		for (name, value) in self.headers {
			if let (Ok(name), Ok(value)) = (
				HeaderName::try_from(name.as_str()),
				HeaderValue::try_from(value.as_str()),
			) {
				response.headers.append(name, value);
			}
		}
		response
	}
}

/// Memoizing request cache: a [`Middleware`] that serves eligible
/// requests from a cache and conditionally stores fresh responses.
///
/// # Examples
///
/// ```
/// use calm_cache::{
/// 	Handler, InMemoryStore, Request, Response, ResponseCache, ResponseCacheConfig,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// struct HelloHandler;
///
/// #[async_trait::async_trait]
/// impl Handler for HelloHandler {
/// 	async fn handle(&self, _request: Request) -> calm_cache::Result<Response> {
/// 		Ok(Response::ok().with_body("hello"))
/// 	}
/// }
///
/// # tokio_test::block_on(async {
/// let config = ResponseCacheConfig::new(Duration::from_secs(15)).with_key_prefix("hello");
/// let cache = Arc::new(ResponseCache::new(InMemoryStore::new(), config));
/// let wrapped = cache.wrap(Arc::new(HelloHandler));
///
/// let request = Request::builder().uri("/").header("host", "testserver").build().unwrap();
/// let response = wrapped.handle(request).await.unwrap();
/// assert_eq!(response.headers.get("x-cache").unwrap(), "Miss");
/// # });
/// ```
pub struct ResponseCache<C: KeyValueStore> {
	cache: Arc<C>,
	config: ResponseCacheConfig,
	key_func: Option<Box<RequestKeyFunc>>,
}

impl<C: KeyValueStore + 'static> ResponseCache<C> {
	/// Wrap `cache` with the given configuration.
	pub fn new(cache: C, config: ResponseCacheConfig) -> Self {
		Self::from_arc(Arc::new(cache), config)
	}

	/// Like [`new`](Self::new) for an already-shared cache.
	pub fn from_arc(cache: Arc<C>, config: ResponseCacheConfig) -> Self {
		Self {
			cache,
			config,
			key_func: None,
		}
	}

	/// Override key derivation entirely. The function's `None` return is
	/// the only sanctioned way to force a bypass irrespective of
	/// [`should_fetch`](Self::should_fetch).
	pub fn with_key_func(
		mut self,
		key_func: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
	) -> Self {
		self.key_func = Some(Box::new(key_func));
		self
	}

	/// The configuration this cache was built with.
	pub fn config(&self) -> &ResponseCacheConfig {
		&self.config
	}

	/// Derive the cache key for a request.
	///
	/// The default joins prefix, method, optional scheme, optional
	/// lowercased host and the full path+query with `#`; disabled
	/// segments become empty but keep their delimiters.
	pub fn derive_key(&self, request: &Request) -> Option<String> {
		if let Some(key_func) = &self.key_func {
			return key_func(request);
		}
		let scheme = if self.config.include_scheme {
			request.scheme()
		} else {
			""
		};
		let host = if self.config.include_host {
			request.get_host().unwrap_or_default().to_lowercase()
		} else {
			String::new()
		};
		Some(format!(
			"{}#{}#{}#{}#{}",
			self.config.key_prefix,
			request.method,
			scheme,
			host,
			request.full_path()
		))
	}

	/// Whether this request may be answered from the cache.
	pub fn should_fetch(&self, request: &Request) -> bool {
		if !self.config.methods.contains(&request.method) {
			return false;
		}
		for (name, pattern) in &self.config.nocache_request_headers {
			for value in request.headers.get_all(name) {
				if let Ok(value) = value.to_str()
					&& pattern.is_match(value)
				{
					return false;
				}
			}
		}
		if self.config.anonymous_only && request.is_authenticated() {
			return false;
		}
		for (name, _) in request.cookies() {
			let excluded = self.config.excluded_cookies.contains(&name);
			if self.config.cache_cookies {
				// Blacklist: any excluded cookie disqualifies.
				if excluded {
					return false;
				}
			} else {
				// Whitelist: only excluded cookies are tolerated.
				if !excluded {
					return false;
				}
			}
		}
		true
	}

	/// Whether this response may be stored.
	pub fn should_store(&self, request: &Request, response: &Response) -> bool {
		if response.is_streaming() {
			return false;
		}
		if !self.config.codes.contains(&response.status.as_u16()) {
			return false;
		}
		for header in &self.config.nocache_response_headers {
			if response.headers.contains_key(header) {
				return false;
			}
		}
		// A consumed CSRF token means the body is visitor-specific.
		if request.csrf_used() {
			return false;
		}
		true
	}

	async fn fetch(&self, key: &str) -> Result<Option<Response>> {
		let Some(raw) = self.cache.get(key).await? else {
			return Ok(None);
		};
		let snapshot: CachedResponse = serde_json::from_slice(&raw)?;
		let mut response = snapshot.into_response();
		if let Some(hit_miss) = &self.config.hit_miss_header {
			response
				.headers
				.insert(hit_miss.name.clone(), hit_miss.hit.clone());
		}
		Ok(Some(response))
	}

	async fn store(cache: &C, key: &str, ttl: Duration, response: &Response) -> Result<()> {
		let snapshot = CachedResponse::from_response(response);
		cache.set(key, serde_json::to_vec(&snapshot)?, Some(ttl)).await
	}

	/// Run the memoization flow around `next`.
	pub async fn process(&self, request: Request, next: Arc<dyn Handler>) -> Result<Response> {
		let key = match self.derive_key(&request) {
			Some(key) if self.should_fetch(&request) => key,
			_ => return next.handle(request).await,
		};

		if let Some(response) = self.fetch(&key).await? {
			debug!(key = %key, "response cache hit");
			return Ok(response);
		}
		debug!(key = %key, "response cache miss");

		// Keep a handle on the request: the handler consumes its clone,
		// and the store decision needs the original (CSRF flag included).
		let kept = request.clone();
		let mut response = next.handle(request).await?;
		if !self.should_store(&kept, &response) {
			return Ok(response);
		}

		if !response.headers.contains_key(LAST_MODIFIED)
			&& let Ok(now) = HeaderValue::try_from(httpdate::fmt_http_date(SystemTime::now()))
		{
			response.headers.insert(LAST_MODIFIED, now);
		}
		if let Some(hit_miss) = &self.config.hit_miss_header {
			response
				.headers
				.insert(hit_miss.name.clone(), hit_miss.miss.clone());
		}

		if response.is_rendered() {
			Self::store(&self.cache, &key, self.config.ttl, &response).await?;
		} else {
			// Deferred body: store once materialization completes.
			let cache = Arc::clone(&self.cache);
			let ttl = self.config.ttl;
			response.add_post_render_callback(Box::new(move |rendered| {
				Box::pin(async move { Self::store(&cache, &key, ttl, rendered).await })
			}));
		}
		Ok(response)
	}

	/// Wrap a handler, producing a handler with the same calling contract
	/// plus cache interception.
	pub fn wrap(self: Arc<Self>, handler: Arc<dyn Handler>) -> CachedHandler<C> {
		CachedHandler {
			cache: self,
			inner: handler,
		}
	}
}

#[async_trait::async_trait]
impl<C: KeyValueStore + 'static> Middleware for ResponseCache<C> {
	async fn process(&self, request: Request, next: Arc<dyn Handler>) -> Result<Response> {
		ResponseCache::process(self, request, next).await
	}
}

/// A handler wrapped with response memoization. The inner handler stays
/// reachable for introspection.
pub struct CachedHandler<C: KeyValueStore> {
	cache: Arc<ResponseCache<C>>,
	inner: Arc<dyn Handler>,
}

impl<C: KeyValueStore + 'static> CachedHandler<C> {
	/// The wrapped handler.
	pub fn inner(&self) -> &Arc<dyn Handler> {
		&self.inner
	}
}

#[async_trait::async_trait]
impl<C: KeyValueStore + 'static> Handler for CachedHandler<C> {
	async fn handle(&self, request: Request) -> Result<Response> {
		self.cache.process(request, self.inner.clone()).await
	}
}

/// Whole-page caching variant of [`ResponseCache`].
///
/// Shares the key derivation and fetch rules but stores any response
/// with an allowed status code, honors a response `Cache-Control:
/// max-age` as the entry TTL, and patches `Expires`/`Cache-Control`
/// headers on stored responses. A `max-age=0` response is never stored.
pub struct PageCache<C: KeyValueStore> {
	inner: ResponseCache<C>,
}

impl<C: KeyValueStore + 'static> PageCache<C> {
	/// Wrap `cache` with the given configuration.
	pub fn new(cache: C, config: ResponseCacheConfig) -> Self {
		Self {
			inner: ResponseCache::new(cache, config),
		}
	}

	/// Override key derivation, as in [`ResponseCache::with_key_func`].
	pub fn with_key_func(
		mut self,
		key_func: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
	) -> Self {
		self.inner = self.inner.with_key_func(key_func);
		self
	}

	fn should_store(&self, response: &Response) -> bool {
		!response.is_streaming() && self.inner.config.codes.contains(&response.status.as_u16())
	}

	/// `max-age` directive of the response's `Cache-Control` header.
	fn max_age(response: &Response) -> Option<u64> {
		let value = response.headers.get(CACHE_CONTROL)?.to_str().ok()?;
		value.split(',').find_map(|directive| {
			directive
				.trim()
				.strip_prefix("max-age=")
				.and_then(|age| age.trim().parse().ok())
		})
	}

	fn patch_response_headers(response: &mut Response, ttl: Duration) {
		if !response.headers.contains_key(EXPIRES)
			&& let Ok(expires) = HeaderValue::try_from(httpdate::fmt_http_date(
				SystemTime::now() + ttl,
			)) {
			response.headers.insert(EXPIRES, expires);
		}
		if !response.headers.contains_key(CACHE_CONTROL)
			&& let Ok(cache_control) =
				HeaderValue::try_from(format!("max-age={}", ttl.as_secs()))
		{
			response.headers.insert(CACHE_CONTROL, cache_control);
		}
	}

	/// Run the page-caching flow around `next`.
	pub async fn process(&self, request: Request, next: Arc<dyn Handler>) -> Result<Response> {
		let key = match self.inner.derive_key(&request) {
			Some(key) if self.inner.should_fetch(&request) => key,
			_ => return next.handle(request).await,
		};

		if let Some(response) = self.inner.fetch(&key).await? {
			debug!(key = %key, "page cache hit");
			return Ok(response);
		}

		let mut response = next.handle(request).await?;
		if !self.should_store(&response) {
			return Ok(response);
		}

		let ttl = Self::max_age(&response)
			.map(Duration::from_secs)
			.unwrap_or(self.inner.config.ttl);
		Self::patch_response_headers(&mut response, ttl);
		if ttl.is_zero() {
			return Ok(response);
		}

		if let Some(hit_miss) = &self.inner.config.hit_miss_header {
			response
				.headers
				.insert(hit_miss.name.clone(), hit_miss.miss.clone());
		}

		if response.is_rendered() {
			ResponseCache::store(&self.inner.cache, &key, ttl, &response).await?;
		} else {
			let cache = Arc::clone(&self.inner.cache);
			response.add_post_render_callback(Box::new(move |rendered| {
				Box::pin(async move { ResponseCache::store(&cache, &key, ttl, rendered).await })
			}));
		}
		Ok(response)
	}
}

#[async_trait::async_trait]
impl<C: KeyValueStore + 'static> Middleware for PageCache<C> {
	async fn process(&self, request: Request, next: Arc<dyn Handler>) -> Result<Response> {
		PageCache::process(self, request, next).await
	}
}
