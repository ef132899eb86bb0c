use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use http::Request;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::proxy::{OAuthProxy, remote_addr, request_host};
use crate::session::SessionState;
use crate::upstream::GAP_AUTH_HEADER;
use crate::Body;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthDecision {
	Accepted,
	Forbidden,
	InternalError,
}

/// What [`OAuthProxy::authenticate`] decided, plus the response headers it
/// accumulated on the way (cookie writes/clears, identity headers).
pub struct AuthOutcome {
	pub decision: AuthDecision,
	pub response_headers: HeaderMap,
}

impl AuthOutcome {
	fn new(decision: AuthDecision, response_headers: HeaderMap) -> Self {
		Self {
			decision,
			response_headers,
		}
	}
}

impl OAuthProxy {
	/// The authentication decision tree. Order matters: refresh before the
	/// expiry check, expiry before validation, validation before the
	/// authorization gate. Validation is a network call and must not run on a
	/// token already known dead.
	pub async fn authenticate(&self, req: &mut Request<Body>) -> AuthOutcome {
		let mut response_headers = HeaderMap::new();
		let remote = remote_addr(req);
		let host = request_host(req);

		let mut save_session = false;
		let mut clear_session = false;
		let mut revalidated = false;

		let mut session = match self.load_cookied_session(req) {
			Ok((session, age)) => {
				if !self.config.cookie_refresh.is_zero() && age > self.config.cookie_refresh {
					info!(
						remote = %remote,
						age = ?age,
						session = %session,
						refresh_after = ?self.config.cookie_refresh,
						"refreshing old session cookie"
					);
					save_session = true;
				}
				Some(session)
			},
			Err(err) => {
				debug!(remote = %remote, "{err}");
				None
			},
		};

		if let Some(mut current) = session.take() {
			match self.provider.refresh_session_if_needed(&mut current).await {
				Ok(false) => session = Some(current),
				Ok(true) => {
					save_session = true;
					revalidated = true;
					session = Some(current);
				},
				Err(err) => {
					info!(
						remote = %remote,
						session = %current,
						error = %err,
						"removing session, error refreshing access token"
					);
					clear_session = true;
				},
			}
		}

		if let Some(current) = session.take() {
			if current.is_expired() {
				info!(remote = %remote, session = %current, "removing session, token expired");
				save_session = false;
				clear_session = true;
			} else {
				session = Some(current);
			}
		}

		if save_session && !revalidated
			&& let Some(current) = session.take()
		{
			if !current.access_token.is_empty()
				&& !self.provider.validate_session_state(&current).await
			{
				info!(remote = %remote, session = %current, "removing session, error validating");
				save_session = false;
				clear_session = true;
			} else {
				session = Some(current);
			}
		}

		if let Some(current) = session.take() {
			if !current.email.is_empty() && !self.validate_email(&current.email) {
				info!(remote = %remote, session = %current, "permission denied, removing session");
				save_session = false;
				clear_session = true;
			} else {
				session = Some(current);
			}
		}

		if save_session
			&& let Some(current) = &session
		{
			if let Err(err) = self.save_session(&mut response_headers, &host, current) {
				warn!(remote = %remote, error = %err, "failed to re-save session cookie");
				return AuthOutcome::new(AuthDecision::InternalError, response_headers);
			}
		}

		if clear_session {
			self.clear_session_cookie(&mut response_headers, &host);
			self.clear_csrf_cookie(&mut response_headers, &host);
		}

		if session.is_none() {
			match self.check_auth_header(req).await {
				Ok(found) => session = found,
				Err(err) => info!(remote = %remote, "{err}"),
			}
		}

		let Some(session) = session else {
			return AuthOutcome::new(AuthDecision::Forbidden, response_headers);
		};

		self.enrich_request(req, &mut response_headers, &session);
		AuthOutcome::new(AuthDecision::Accepted, response_headers)
	}

	/// Identity headers per policy, applied once the requester is known.
	fn enrich_request(
		&self,
		req: &mut Request<Body>,
		response_headers: &mut HeaderMap,
		session: &SessionState,
	) {
		let headers = req.headers_mut();
		if self.config.pass_basic_auth {
			let credentials = format!(
				"{}:{}",
				session.user,
				self.config.basic_auth_password.expose_secret()
			);
			let basic = format!("Basic {}", STANDARD.encode(credentials.as_bytes()));
			if let Ok(value) = HeaderValue::from_str(&basic) {
				headers.insert(AUTHORIZATION, value);
			}
		}
		if self.config.pass_basic_auth || self.config.pass_user_headers {
			set_header(headers, "x-forwarded-user", &session.user);
			if !session.email.is_empty() {
				set_header(headers, "x-forwarded-email", &session.email);
			}
		}
		if self.config.set_xauthrequest {
			set_header(response_headers, "x-auth-request-user", &session.user);
			if !session.email.is_empty() {
				set_header(response_headers, "x-auth-request-email", &session.email);
			}
		}
		if self.config.pass_access_token && !session.access_token.is_empty() {
			set_header(headers, "x-forwarded-access-token", &session.access_token);
		}
		set_header(response_headers, GAP_AUTH_HEADER, session.principal());
	}

	/// Bearer and basic identification from the `Authorization` header. No
	/// session cookie is ever written for these.
	async fn check_auth_header(
		&self,
		req: &Request<Body>,
	) -> anyhow::Result<Option<SessionState>> {
		let Some(auth) = req.headers().get(AUTHORIZATION) else {
			return Ok(None);
		};
		let auth = auth
			.to_str()
			.map_err(|_| anyhow::anyhow!("invalid authorization header"))?;
		let Some((scheme, credentials)) = auth.split_once(' ') else {
			anyhow::bail!("invalid authorization header {auth:?}");
		};
		match scheme {
			"Basic" => {
				let Some(htpasswd) = &self.htpasswd else {
					return Ok(None);
				};
				let decoded = STANDARD
					.decode(credentials.as_bytes())
					.map_err(|e| anyhow::anyhow!("invalid basic auth encoding: {e}"))?;
				let decoded = String::from_utf8(decoded)
					.map_err(|_| anyhow::anyhow!("invalid basic auth encoding"))?;
				let Some((user, password)) = decoded.split_once(':') else {
					anyhow::bail!("invalid basic auth format");
				};
				if htpasswd.validate(user, password) {
					info!(user, "authenticated via basic auth");
					return Ok(Some(SessionState {
						user: user.to_string(),
						..Default::default()
					}));
				}
				anyhow::bail!("{user:?} not found in htpasswd file")
			},
			"Bearer" => {
				let probe = SessionState {
					access_token: credentials.to_string(),
					..Default::default()
				};
				let email = self
					.provider
					.get_email_address(&probe)
					.await
					.map_err(|_| anyhow::anyhow!("invalid bearer token"))?;
				Ok(Some(SessionState {
					user: email.clone(),
					email,
					access_token: credentials.to_string(),
					..Default::default()
				}))
			},
			other => anyhow::bail!("invalid authorization header, unsupported scheme {other:?}"),
		}
	}
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
	match HeaderValue::from_str(value) {
		Ok(value) => {
			headers.insert(name, value);
		},
		Err(_) => debug!(header = name, "dropping header with invalid value"),
	}
}
