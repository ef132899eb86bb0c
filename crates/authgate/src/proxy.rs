use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use cookie::Cookie;
use cookie::time::{Duration as CookieDuration, OffsetDateTime};
use http::header::{COOKIE, HeaderValue, SET_COOKIE};
use http::{Request, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::cookies::{self, CookieCipher, CookieError};
use crate::htpasswd::Htpasswd;
use crate::metrics::Metrics;
use crate::pages::Pages;
use crate::providers::Provider;
use crate::session::{SessionError, SessionState};
use crate::signature::RequestSigner;
use crate::upstream::UpstreamRegistry;
use crate::validator::Validator;
use crate::{Body, full};

/// Peer address of the inbound connection, inserted by the server glue so
/// handlers can log it for audit trails.
#[derive(Clone, Copy, Debug)]
pub struct RemoteAddr(pub SocketAddr);

#[derive(Debug, thiserror::Error)]
pub(crate) enum LoadSessionError {
	#[error("cookie {0:?} not present")]
	NotPresent(String),
	#[error("cookie rejected: {0}")]
	Cookie(#[from] CookieError),
	#[error(transparent)]
	Session(#[from] SessionError),
}

/// The authenticating reverse proxy. Construct once at startup; every field
/// is immutable afterwards and requests are served concurrently through
/// [`OAuthProxy::serve`].
pub struct OAuthProxy {
	pub(crate) config: ProxyConfig,
	pub(crate) provider: Arc<dyn Provider>,
	pub(crate) validator: Validator,
	pub(crate) htpasswd: Option<Arc<Htpasswd>>,
	pub(crate) upstreams: UpstreamRegistry,
	pub(crate) cipher: Option<CookieCipher>,
	pub(crate) pages: Pages,
	pub(crate) metrics: Metrics,
	whitelist: Vec<regex::Regex>,

	pub(crate) csrf_cookie_name: String,
	metrics_path: String,
	pub(crate) sign_in_path: String,
	sign_out_path: String,
	start_path: String,
	callback_path: String,
	auth_only_path: String,
}

impl OAuthProxy {
	pub fn new(
		config: ProxyConfig,
		provider: Arc<dyn Provider>,
		validator: Validator,
		htpasswd: Option<Arc<Htpasswd>>,
	) -> anyhow::Result<Self> {
		let whitelist = config
			.skip_auth_regex
			.iter()
			.map(|pattern| {
				regex::Regex::new(pattern)
					.map_err(|e| anyhow::anyhow!("invalid skip-auth-regex {pattern:?}: {e}"))
			})
			.collect::<anyhow::Result<Vec<_>>>()?;
		for pattern in &whitelist {
			info!(regex = %pattern, "compiled skip-auth-regex");
		}

		let signer = config
			.signature_key
			.as_deref()
			.map(RequestSigner::parse)
			.transpose()?;
		let upstreams = UpstreamRegistry::new(&config.upstreams, config.pass_host_header, signer)?;

		// Tokens are only persisted into the cookie when something will read
		// them back out: access-token passthrough or cookie refresh.
		let cipher = if config.pass_access_token || config.cookie_refresh > Duration::ZERO {
			Some(CookieCipher::new(&config.cookie_secret_bytes())?)
		} else {
			None
		};

		let pages = Pages::load(config.custom_templates_dir.as_deref())?;

		let prefix = config.proxy_prefix.trim_end_matches('/').to_string();
		let refresh = if config.cookie_refresh.is_zero() {
			"disabled".to_string()
		} else {
			format!("after {:?}", config.cookie_refresh)
		};
		info!(
			provider = %provider.data().provider_name,
			client_id = %provider.data().client_id,
			"proxy configured"
		);
		info!(
			name = %config.cookie_name,
			secure = config.cookie_secure,
			httponly = config.cookie_http_only,
			expire = ?config.cookie_expire,
			domain = config.cookie_domain.as_deref().unwrap_or("<default>"),
			refresh = %refresh,
			"cookie settings"
		);

		Ok(Self {
			csrf_cookie_name: config.csrf_cookie_name(),
			metrics_path: format!("{prefix}/metrics"),
			sign_in_path: format!("{prefix}/sign_in"),
			sign_out_path: format!("{prefix}/sign_out"),
			start_path: format!("{prefix}/start"),
			callback_path: format!("{prefix}/callback"),
			auth_only_path: format!("{prefix}/auth"),
			config,
			provider,
			validator,
			htpasswd,
			upstreams,
			cipher,
			pages,
			metrics: Metrics::new(),
			whitelist,
		})
	}

	pub(crate) fn display_htpasswd_form(&self) -> bool {
		self.htpasswd.is_some() && self.config.display_htpasswd_form
	}

	pub(crate) fn validate_email(&self, email: &str) -> bool {
		(self.validator.as_ref())(email)
	}

	/// Route one request. First match wins; everything except the metrics
	/// exposition is wrapped in a latency histogram keyed by handler and
	/// status code.
	#[tracing::instrument(skip_all, fields(method = %req.method(), path = req.uri().path()))]
	pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
		let path = req.uri().path().to_string();
		let start = Instant::now();
		let (handler, response) = if path == "/robots.txt" {
			("robots", self.robots_txt())
		} else if path == self.metrics_path {
			return self.metrics_page();
		} else if path == "/ping" {
			("ping", self.ping())
		} else if self.is_whitelisted_request(&req) {
			("whitelist", self.upstreams.dispatch(req, None).await)
		} else if path == self.sign_in_path {
			("signIn", self.sign_in(req).await)
		} else if path == self.sign_out_path {
			("signOut", self.sign_out(req).await)
		} else if path == self.start_path {
			("start", self.oauth_start(req).await)
		} else if path == self.callback_path {
			("callback", self.oauth_callback(req).await)
		} else if path == self.auth_only_path {
			("authOnly", self.authenticate_only(req).await)
		} else {
			("proxy", self.proxy_request(req).await)
		};
		self.metrics.observe(handler, response.status(), start.elapsed());
		response
	}

	fn is_whitelisted_request(&self, req: &Request<Body>) -> bool {
		let preflight = self.config.skip_auth_preflight && req.method() == http::Method::OPTIONS;
		preflight || self.is_whitelisted_path(req.uri().path())
	}

	fn is_whitelisted_path(&self, path: &str) -> bool {
		self.whitelist.iter().any(|re| re.is_match(path))
	}

	fn robots_txt(&self) -> Response<Body> {
		plain(StatusCode::OK, "User-agent: *\nDisallow: /")
	}

	fn ping(&self) -> Response<Body> {
		plain(StatusCode::OK, "OK")
	}

	fn metrics_page(&self) -> Response<Body> {
		Response::builder()
			.status(StatusCode::OK)
			.header(
				http::header::CONTENT_TYPE,
				"application/openmetrics-text; version=1.0.0; charset=utf-8",
			)
			.body(full(self.metrics.encode()))
			.unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error"))
	}

	// --- Cookie plumbing ---

	fn cookie_domain(&self, host: &str) -> String {
		// Request host, sans port. Bracketed IPv6 hosts keep their brackets.
		let host = match host.rfind(':') {
			Some(idx) if !host[idx + 1..].contains(']') && host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
				&host[..idx]
			},
			_ => host,
		};
		match &self.config.cookie_domain {
			Some(configured) => {
				if !host.ends_with(configured.as_str()) {
					warn!(
						host,
						configured = %configured,
						"request host does not match configured cookie domain"
					);
				}
				configured.clone()
			},
			None => host.to_string(),
		}
	}

	fn make_cookie(
		&self,
		host: &str,
		name: String,
		value: String,
		expires_in: CookieDuration,
	) -> Cookie<'static> {
		let mut builder = Cookie::build((name, value))
			.path("/")
			.http_only(self.config.cookie_http_only)
			.secure(self.config.cookie_secure)
			.expires(OffsetDateTime::now_utc() + expires_in);
		let domain = self.cookie_domain(host);
		if !domain.is_empty() {
			builder = builder.domain(domain);
		}
		builder.build()
	}

	fn expire_duration(&self) -> CookieDuration {
		CookieDuration::seconds(self.config.cookie_expire.as_secs().min(i64::MAX as u64) as i64)
	}

	fn make_session_cookie(&self, host: &str, value: String, expires_in: CookieDuration) -> Cookie<'static> {
		let value = if value.is_empty() {
			value
		} else {
			let sealed = cookies::sign_value(
				secrecy::ExposeSecret::expose_secret(&self.config.cookie_secret),
				&self.config.cookie_name,
				&value,
				SystemTime::now(),
			);
			if sealed.len() > 4096 {
				// Browsers cap cookies at 4kb; emit anyway and let the
				// operator see why sessions are being dropped.
				warn!(size = sealed.len(), "session cookie exceeds 4096 bytes");
			}
			sealed
		};
		self.make_cookie(host, self.config.cookie_name.clone(), value, expires_in)
	}

	pub(crate) fn save_session(
		&self,
		headers: &mut http::HeaderMap,
		host: &str,
		session: &SessionState,
	) -> Result<(), SessionError> {
		let value = self
			.provider
			.cookie_for_session(session, self.cipher.as_ref())?;
		let cookie = self.make_session_cookie(host, value, self.expire_duration());
		append_set_cookie(headers, &cookie);
		Ok(())
	}

	pub(crate) fn clear_session_cookie(&self, headers: &mut http::HeaderMap, host: &str) {
		let cookie = self.make_session_cookie(host, String::new(), CookieDuration::hours(-1));
		append_set_cookie(headers, &cookie);
	}

	pub(crate) fn set_csrf_cookie(&self, headers: &mut http::HeaderMap, host: &str, value: &str) {
		let cookie = self.make_cookie(
			host,
			self.csrf_cookie_name.clone(),
			value.to_string(),
			self.expire_duration(),
		);
		append_set_cookie(headers, &cookie);
	}

	pub(crate) fn clear_csrf_cookie(&self, headers: &mut http::HeaderMap, host: &str) {
		let cookie = self.make_cookie(
			host,
			self.csrf_cookie_name.clone(),
			String::new(),
			CookieDuration::hours(-1),
		);
		append_set_cookie(headers, &cookie);
	}

	pub(crate) fn request_cookie(&self, req: &Request<Body>, name: &str) -> Option<String> {
		for header in req.headers().get_all(COOKIE) {
			let Ok(raw) = header.to_str() else { continue };
			for cookie in Cookie::split_parse(raw) {
				match cookie {
					Ok(cookie) if cookie.name() == name => return Some(cookie.value().to_string()),
					Ok(_) => {},
					Err(err) => debug!("ignoring malformed cookie: {err}"),
				}
			}
		}
		None
	}

	/// Load and verify the cookied session. Returns the session plus the
	/// cookie's age, which drives the refresh decision.
	pub(crate) fn load_cookied_session(
		&self,
		req: &Request<Body>,
	) -> Result<(SessionState, Duration), LoadSessionError> {
		let Some(sealed) = self.request_cookie(req, &self.config.cookie_name) else {
			return Err(LoadSessionError::NotPresent(self.config.cookie_name.clone()));
		};
		let (value, issued_at) = cookies::validate_value(
			secrecy::ExposeSecret::expose_secret(&self.config.cookie_secret),
			&self.config.cookie_name,
			&sealed,
			self.config.cookie_expire,
		)?;
		let session = self
			.provider
			.session_from_cookie(&value, self.cipher.as_ref())?;
		let age = SystemTime::now()
			.duration_since(issued_at)
			.unwrap_or_default();
		Ok((session, age))
	}

	pub(crate) fn get_redirect_uri(&self, host: &str) -> Option<url::Url> {
		if let Some(configured) = &self.config.redirect_url
			&& configured.host_str().is_some()
		{
			return Some(configured.clone());
		}
		let scheme = if self.config.cookie_secure { "https" } else { "http" };
		format!("{scheme}://{host}{}", self.callback_path).parse().ok()
	}
}

pub(crate) fn request_host(req: &Request<Body>) -> String {
	if let Some(host) = req.headers().get(http::header::HOST)
		&& let Ok(host) = host.to_str()
	{
		return host.to_string();
	}
	req
		.uri()
		.authority()
		.map(|a| a.as_str().to_string())
		.unwrap_or_default()
}

pub(crate) fn remote_addr(req: &Request<Body>) -> String {
	let mut addr = req
		.extensions()
		.get::<RemoteAddr>()
		.map(|remote| remote.0.to_string())
		.unwrap_or_else(|| "-".to_string());
	if let Some(real_ip) = req.headers().get("x-real-ip")
		&& let Ok(real_ip) = real_ip.to_str()
	{
		addr = format!("{addr} ({real_ip:?})");
	}
	addr
}

pub(crate) fn append_set_cookie(headers: &mut http::HeaderMap, cookie: &Cookie<'_>) {
	if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
		headers.append(SET_COOKIE, value);
	}
}

pub(crate) fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full(body))
		.unwrap_or_else(|_| Response::new(crate::empty()))
}

pub(crate) fn html(status: StatusCode, body: String) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
		.body(full(body))
		.unwrap_or_else(|_| Response::new(crate::empty()))
}

pub(crate) fn redirect(location: &str) -> Response<Body> {
	Response::builder()
		.status(StatusCode::FOUND)
		.header(http::header::LOCATION, location)
		.body(crate::empty())
		.unwrap_or_else(|_| Response::new(crate::empty()))
}
