//! Request/response collaborator types and the handler/middleware seam.
//!
//! These are the minimal HTTP-side contracts the response cache decides
//! over: a request exposing method, scheme, host, path, headers, cookies
//! and an authenticated-principal indicator; a response exposing status,
//! headers, a streaming indicator and a deferred-render hook; and the
//! `Handler`/`Middleware` traits used to compose them.

mod handler;
mod request;
mod response;

pub use handler::{Handler, Middleware};
pub use request::{AuthState, Request, RequestBuilder};
pub use response::{PostRenderCallback, Response};
