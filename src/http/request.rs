use bytes::Bytes;
use hyper::header::{COOKIE, HOST};
use hyper::{HeaderMap, Method, Uri, Version};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CacheError, Result};

/// Authentication state attached to a request by upstream auth layers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
	/// The authenticated principal's ID, empty when anonymous.
	pub user_id: String,
	/// Whether a principal is authenticated at all.
	pub is_authenticated: bool,
}

impl AuthState {
	/// An anonymous (unauthenticated) state.
	pub fn anonymous() -> Self {
		Self {
			user_id: String::new(),
			is_authenticated: false,
		}
	}

	/// An authenticated state for the given principal.
	pub fn authenticated(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			is_authenticated: true,
		}
	}
}

/// HTTP request representation.
///
/// Clones share the CSRF-consumption flag, so a wrapper that hands a
/// clone to a handler still observes whether rendering consumed a CSRF
/// token.
#[derive(Clone)]
pub struct Request {
	pub method: Method,
	pub uri: Uri,
	pub version: Version,
	pub headers: HeaderMap,
	pub body: Bytes,
	is_secure: bool,
	auth: AuthState,
	csrf_used: Arc<AtomicBool>,
}

impl Request {
	/// Start building a request.
	///
	/// # Examples
	///
	/// ```
	/// use calm_cache::Request;
	/// use hyper::Method;
	///
	/// let request = Request::builder()
	/// 	.method(Method::GET)
	/// 	.uri("/url1/?k1=v1")
	/// 	.build()
	/// 	.unwrap();
	/// assert_eq!(request.full_path(), "/url1/?k1=v1");
	/// ```
	pub fn builder() -> RequestBuilder {
		RequestBuilder::default()
	}

	/// Returns true if the request was made over HTTPS.
	pub fn is_secure(&self) -> bool {
		self.is_secure
	}

	/// The scheme of the request, `http` or `https`.
	pub fn scheme(&self) -> &'static str {
		if self.is_secure { "https" } else { "http" }
	}

	/// The requested host, from the `Host:` header.
	pub fn get_host(&self) -> Option<String> {
		self.headers
			.get(HOST)
			.and_then(|h| h.to_str().ok())
			.map(|h| h.to_string())
	}

	/// Path plus query string, e.g. `/url1/?k1=v1`.
	pub fn full_path(&self) -> String {
		match self.uri.query() {
			Some(query) => format!("{}?{}", self.uri.path(), query),
			None => self.uri.path().to_string(),
		}
	}

	/// The request's authentication state.
	pub fn auth(&self) -> &AuthState {
		&self.auth
	}

	/// Whether an authenticated principal is attached.
	pub fn is_authenticated(&self) -> bool {
		self.auth.is_authenticated
	}

	/// Record that a CSRF-protection token was consumed while producing
	/// the response. Visible through every clone of this request.
	pub fn mark_csrf_used(&self) {
		self.csrf_used.store(true, Ordering::Relaxed);
	}

	/// Whether a CSRF-protection token was consumed.
	pub fn csrf_used(&self) -> bool {
		self.csrf_used.load(Ordering::Relaxed)
	}

	/// Cookies sent with the request, in header order.
	///
	/// Malformed pairs (missing `=`, empty or invalid name) are skipped.
	pub fn cookies(&self) -> Vec<(String, String)> {
		self.headers
			.get_all(COOKIE)
			.iter()
			.filter_map(|h| h.to_str().ok())
			.flat_map(Self::parse_cookies)
			.collect()
	}

	fn parse_cookies(header: &str) -> Vec<(String, String)> {
		let mut cookies = Vec::new();
		for cookie in header.split(';') {
			let cookie = cookie.trim();
			if cookie.is_empty() {
				continue;
			}
			let mut parts = cookie.splitn(2, '=');
			let name = match parts.next() {
				Some(name) => name.trim(),
				None => continue,
			};
			let value = match parts.next() {
				Some(value) => value.trim(),
				// Missing '=' means malformed cookie - skip it
				None => continue,
			};
			if name.is_empty() || !Self::is_valid_cookie_name(name) {
				continue;
			}
			cookies.push((name.to_string(), value.to_string()));
		}
		cookies
	}

	/// Validate cookie name per RFC 6265: visible ASCII, no separators.
	fn is_valid_cookie_name(name: &str) -> bool {
		name.chars().all(|c| {
			let code = c as u32;
			(0x21..=0x7E).contains(&code)
				&& !matches!(
					c,
					'(' | ')'
						| '<' | '>' | '@' | ','
						| ';' | ':' | '\\' | '"'
						| '/' | '[' | ']' | '?'
						| '=' | '{' | '}' | ' '
						| '\t'
				)
		})
	}
}

/// Builder for [`Request`].
#[derive(Default)]
pub struct RequestBuilder {
	method: Option<Method>,
	uri: Option<String>,
	version: Option<Version>,
	headers: HeaderMap,
	body: Bytes,
	is_secure: bool,
	auth: Option<AuthState>,
}

impl RequestBuilder {
	/// Set the request method. Defaults to GET.
	pub fn method(mut self, method: Method) -> Self {
		self.method = Some(method);
		self
	}

	/// Set the request URI (path and optional query). Required.
	pub fn uri(mut self, uri: impl Into<String>) -> Self {
		self.uri = Some(uri.into());
		self
	}

	/// Set the HTTP version. Defaults to HTTP/1.1.
	pub fn version(mut self, version: Version) -> Self {
		self.version = Some(version);
		self
	}

	/// Replace the header map.
	pub fn headers(mut self, headers: HeaderMap) -> Self {
		self.headers = headers;
		self
	}

	/// Add a single header. Invalid names or values are rejected at
	/// `build` time.
	pub fn header(mut self, name: &str, value: &str) -> Self {
		if let (Ok(name), Ok(value)) = (
			hyper::header::HeaderName::try_from(name),
			hyper::header::HeaderValue::try_from(value),
		) {
			self.headers.append(name, value);
		}
		self
	}

	/// Set the request body.
	pub fn body(mut self, body: Bytes) -> Self {
		self.body = body;
		self
	}

	/// Mark the request as carried over TLS.
	pub fn secure(mut self, is_secure: bool) -> Self {
		self.is_secure = is_secure;
		self
	}

	/// Attach an authentication state. Defaults to anonymous.
	pub fn auth(mut self, auth: AuthState) -> Self {
		self.auth = Some(auth);
		self
	}

	/// Finalize the request.
	///
	/// # Errors
	///
	/// Fails when the URI is missing or unparseable.
	pub fn build(self) -> Result<Request> {
		let uri = self
			.uri
			.ok_or_else(|| CacheError::Misconfigured("request URI is required".into()))?;
		let uri: Uri = uri
			.parse()
			.map_err(|e| CacheError::Misconfigured(format!("invalid request URI: {e}")))?;
		Ok(Request {
			method: self.method.unwrap_or(Method::GET),
			uri,
			version: self.version.unwrap_or(Version::HTTP_11),
			headers: self.headers,
			body: self.body,
			is_secure: self.is_secure,
			auth: self.auth.unwrap_or_else(AuthState::anonymous),
			csrf_used: Arc::new(AtomicBool::new(false)),
		})
	}
}
