use std::path::{Component, Path, PathBuf};

use http::header::{CONNECTION, HOST, HeaderName, HeaderValue, UPGRADE};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::copy_bidirectional;
use tracing::{debug, info, warn};
use url::Url;

use crate::signature::{RequestSigner, SIGNATURE_HEADER};
use crate::{Body, empty, full, incoming};

// Stored lowercase; HTTP header names are case-insensitive and the http
// crate normalizes them anyway.
pub const UPSTREAM_ADDRESS_HEADER: &str = "gap-upstream-address";
pub const GAP_AUTH_HEADER: &str = "gap-auth";

/// Hop-by-hop headers stripped before forwarding (RFC 9110 §7.6.1). Upgrade
/// requests keep theirs so the handshake can be relayed.
const HOP_BY_HOP_HEADERS: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

#[derive(Debug)]
enum UpstreamKind {
	/// Single-host reverse proxy at the URL's authority.
	Http { target: Url },
	/// File server rooted at a local path, serving with the prefix stripped.
	File { root: PathBuf },
}

#[derive(Debug)]
struct Upstream {
	prefix: String,
	kind: UpstreamKind,
}

/// Maps request paths to upstream handlers, built once from the configured
/// upstream list. Dispatch is by longest path-prefix match.
pub struct UpstreamRegistry {
	upstreams: Vec<Upstream>,
	client: HttpsClient,
	signer: Option<RequestSigner>,
	pass_host_header: bool,
}

impl std::fmt::Debug for UpstreamRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UpstreamRegistry")
			.field("upstreams", &self.upstreams)
			.finish_non_exhaustive()
	}
}

impl UpstreamRegistry {
	pub fn new(
		upstreams: &[Url],
		pass_host_header: bool,
		signer: Option<RequestSigner>,
	) -> anyhow::Result<Self> {
		let mut mapped = Vec::with_capacity(upstreams.len());
		for url in upstreams {
			match url.scheme() {
				"http" | "https" => {
					let prefix = if url.path().is_empty() {
						"/".to_string()
					} else {
						url.path().to_string()
					};
					let mut target = url.clone();
					target.set_path("");
					target.set_query(None);
					target.set_fragment(None);
					if target.host_str().is_none() {
						anyhow::bail!("upstream {url} has no host");
					}
					info!(path = %prefix, upstream = %target, "mapping path to upstream");
					mapped.push(Upstream {
						prefix,
						kind: UpstreamKind::Http { target },
					});
				},
				"file" => {
					let prefix = match url.fragment() {
						Some(fragment) if !fragment.is_empty() => fragment.to_string(),
						_ => url.path().to_string(),
					};
					let root = PathBuf::from(url.path());
					info!(path = %prefix, root = %root.display(), "mapping path to file system");
					mapped.push(Upstream {
						prefix,
						kind: UpstreamKind::File { root },
					});
				},
				other => anyhow::bail!("unknown upstream protocol {other}"),
			}
		}

		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_webpki_roots()
			.https_or_http()
			.enable_http1()
			.build();
		let client = Client::builder(TokioExecutor::new()).build(https);

		Ok(Self {
			upstreams: mapped,
			client,
			signer,
			pass_host_header,
		})
	}

	fn resolve(&self, path: &str) -> Option<&Upstream> {
		self
			.upstreams
			.iter()
			.filter(|u| path.starts_with(u.prefix.as_str()))
			.max_by_key(|u| u.prefix.len())
	}

	/// Forward one request to its mapped upstream. `gap_auth` carries the
	/// authenticated identity for request signing; `None` on whitelisted
	/// requests.
	pub async fn dispatch(&self, req: Request<Body>, gap_auth: Option<HeaderValue>) -> Response<Body> {
		let path = req.uri().path().to_string();
		let Some(upstream) = self.resolve(&path) else {
			return plain(StatusCode::NOT_FOUND, "404 page not found\n");
		};
		match &upstream.kind {
			UpstreamKind::Http { target } => self.proxy(req, target, gap_auth).await,
			UpstreamKind::File { root } => {
				let mut response = serve_file(root, &upstream.prefix, &path).await;
				response
					.headers_mut()
					.insert(UPSTREAM_ADDRESS_HEADER, HeaderValue::from_static("file"));
				response
			},
		}
	}

	async fn proxy(
		&self,
		mut req: Request<Body>,
		target: &Url,
		gap_auth: Option<HeaderValue>,
	) -> Response<Body> {
		let authority = match target.port() {
			Some(port) => format!("{}:{port}", target.host_str().unwrap_or_default()),
			None => target.host_str().unwrap_or_default().to_string(),
		};
		let upstream_address = match HeaderValue::from_str(&authority) {
			Ok(value) => value,
			Err(_) => return plain(StatusCode::BAD_GATEWAY, "Bad Gateway"),
		};

		// The outgoing request URI carries the inbound path verbatim so
		// encoded slashes survive the hop.
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		let out_uri: Uri = match format!("{}://{}{}", target.scheme(), authority, path_and_query).parse()
		{
			Ok(uri) => uri,
			Err(err) => {
				warn!(error = %err, "failed to build upstream uri");
				return plain(StatusCode::BAD_GATEWAY, "Bad Gateway");
			},
		};

		let websocket = is_websocket_request(req.headers());
		let inbound_host = req.headers().get(HOST).cloned();
		*req.uri_mut() = out_uri;
		if self.pass_host_header {
			if let Some(host) = inbound_host {
				req.headers_mut().insert(HOST, host);
			}
		} else {
			// The client fills Host in from the target URI.
			req.headers_mut().remove(HOST);
		}

		if websocket {
			let mut response = self.tunnel_websocket(req).await;
			response
				.headers_mut()
				.insert(UPSTREAM_ADDRESS_HEADER, upstream_address);
			return response;
		}

		for name in HOP_BY_HOP_HEADERS {
			req.headers_mut().remove(*name);
		}

		let req = if let Some(signer) = &self.signer {
			match sign_request(signer, req, gap_auth).await {
				Ok(req) => req,
				Err(err) => {
					warn!(error = %err, "failed to read request body for signing");
					return plain(StatusCode::BAD_GATEWAY, "Bad Gateway");
				},
			}
		} else {
			req
		};

		match self.client.request(req).await {
			Ok(response) => {
				let mut response = response.map(incoming);
				response
					.headers_mut()
					.insert(UPSTREAM_ADDRESS_HEADER, upstream_address);
				response
			},
			Err(err) => {
				warn!(error = %err, upstream = %authority, "upstream request failed");
				plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
			},
		}
	}

	/// Relay the upgrade handshake, then pump bytes both ways until either
	/// side closes.
	async fn tunnel_websocket(&self, mut req: Request<Body>) -> Response<Body> {
		let mut handshake = Request::builder()
			.method(req.method().clone())
			.uri(req.uri().clone());
		if let Some(headers) = handshake.headers_mut() {
			headers.extend(req.headers().clone());
		}
		let handshake = match handshake.body(empty()) {
			Ok(handshake) => handshake,
			Err(err) => {
				warn!(error = %err, "failed to build websocket handshake");
				return plain(StatusCode::BAD_GATEWAY, "Bad Gateway");
			},
		};

		let mut upstream_response = match self.client.request(handshake).await {
			Ok(response) => response,
			Err(err) => {
				warn!(error = %err, "websocket upstream dial failed");
				return plain(StatusCode::BAD_GATEWAY, "Bad Gateway");
			},
		};

		if upstream_response.status() == StatusCode::SWITCHING_PROTOCOLS {
			let client_upgrade = hyper::upgrade::on(&mut req);
			let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
			tokio::spawn(async move {
				match tokio::try_join!(client_upgrade, upstream_upgrade) {
					Ok((client_io, upstream_io)) => {
						let mut client_io = TokioIo::new(client_io);
						let mut upstream_io = TokioIo::new(upstream_io);
						if let Err(err) = copy_bidirectional(&mut client_io, &mut upstream_io).await {
							debug!(error = %err, "websocket pipe closed");
						}
					},
					Err(err) => warn!(error = %err, "websocket upgrade failed"),
				}
			});
		}

		upstream_response.map(incoming)
	}
}

/// Buffer the body, stamp the identity header, and emit `GAP-Signature` over
/// the canonical method/header/path/body tuple.
async fn sign_request(
	signer: &RequestSigner,
	req: Request<Body>,
	gap_auth: Option<HeaderValue>,
) -> Result<Request<Body>, crate::BoxError> {
	let (mut parts, body) = req.into_parts();
	let body = body.collect().await?.to_bytes();
	if let Some(identity) = gap_auth {
		parts.headers.insert(GAP_AUTH_HEADER, identity);
	}
	let signature = signer.sign(&parts.method, &parts.uri, &parts.headers, &body);
	if let Ok(value) = HeaderValue::from_str(&signature) {
		parts.headers.insert(SIGNATURE_HEADER, value);
	}
	Ok(Request::from_parts(parts, full(body)))
}

pub fn is_websocket_request(headers: &http::HeaderMap) -> bool {
	header_has_token(headers, CONNECTION, "upgrade") && header_has_token(headers, UPGRADE, "websocket")
}

fn header_has_token(headers: &http::HeaderMap, name: HeaderName, token: &str) -> bool {
	headers.get_all(name).iter().any(|value| {
		value
			.to_str()
			.map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
			.unwrap_or(false)
	})
}

async fn serve_file(root: &Path, prefix: &str, request_path: &str) -> Response<Body> {
	let rel = request_path
		.strip_prefix(prefix)
		.unwrap_or(request_path)
		.trim_start_matches('/');
	let rel: PathBuf = match percent_decode(rel) {
		Some(decoded) => decoded,
		None => return plain(StatusCode::BAD_REQUEST, "Bad Request"),
	};
	// Only plain path segments; anything that climbs out of the root is
	// rejected.
	if rel
		.components()
		.any(|c| !matches!(c, Component::Normal(_)))
	{
		return plain(StatusCode::BAD_REQUEST, "Bad Request");
	}

	let mut path = root.join(rel);
	match tokio::fs::metadata(&path).await {
		Ok(meta) if meta.is_dir() => path = path.join("index.html"),
		Ok(_) => {},
		Err(_) => return plain(StatusCode::NOT_FOUND, "404 page not found\n"),
	}
	match tokio::fs::read(&path).await {
		Ok(contents) => Response::builder()
			.status(StatusCode::OK)
			.header(http::header::CONTENT_TYPE, content_type(&path))
			.body(full(contents))
			.unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error")),
		Err(_) => plain(StatusCode::NOT_FOUND, "404 page not found\n"),
	}
}

fn percent_decode(path: &str) -> Option<PathBuf> {
	let decoded = percent_encoding::percent_decode_str(path)
		.decode_utf8()
		.ok()?;
	if decoded.contains('\0') {
		return None;
	}
	Some(PathBuf::from(decoded.into_owned()))
}

fn content_type(path: &Path) -> &'static str {
	match path.extension().and_then(|e| e.to_str()) {
		Some("html") | Some("htm") => "text/html; charset=utf-8",
		Some("css") => "text/css; charset=utf-8",
		Some("js") => "text/javascript; charset=utf-8",
		Some("json") => "application/json",
		Some("png") => "image/png",
		Some("jpg") | Some("jpeg") => "image/jpeg",
		Some("gif") => "image/gif",
		Some("svg") => "image/svg+xml",
		Some("ico") => "image/x-icon",
		Some("txt") => "text/plain; charset=utf-8",
		Some("pdf") => "application/pdf",
		Some("wasm") => "application/wasm",
		_ => "application/octet-stream",
	}
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("text/plain; charset=utf-8"),
		)
		.body(full(body))
		.unwrap_or_else(|_| Response::new(empty()))
}
