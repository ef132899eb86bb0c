pub mod auth;
pub mod config;
pub mod cookies;
pub mod flow;
pub mod htpasswd;
pub mod metrics;
pub mod pages;
pub mod providers;
pub mod proxy;
pub mod session;
pub mod signature;
pub mod upstream;
pub mod validator;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified body type for everything the proxy sends: handler pages, upstream
/// request bodies, and passed-through inbound bodies.
pub type Body = BoxBody<Bytes, BoxError>;

pub fn empty() -> Body {
	Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full(data: impl Into<Bytes>) -> Body {
	Full::new(data.into())
		.map_err(|never| match never {})
		.boxed()
}

/// Convert a hyper inbound body into the unified [`Body`].
pub fn incoming(body: hyper::body::Incoming) -> Body {
	body.map_err(|e| Box::new(e) as BoxError).boxed()
}
