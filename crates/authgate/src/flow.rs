use http::header::{HeaderMap, SET_COOKIE};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tracing::{info, warn};

use crate::auth::AuthDecision;
use crate::cookies::{self, constant_time_eq};
use crate::pages::SignInData;
use crate::proxy::{OAuthProxy, html, plain, redirect, remote_addr};
use crate::session::SessionState;
use crate::{Body, VERSION};

/// Merged query and urlencoded-body parameters, first value wins.
pub(crate) struct Form(Vec<(String, String)>);

impl Form {
	pub(crate) async fn parse(parts: &Parts, body: Body) -> Result<Self, crate::BoxError> {
		let mut fields: Vec<(String, String)> = Vec::new();
		if let Some(query) = parts.uri.query() {
			fields.extend(
				url::form_urlencoded::parse(query.as_bytes())
					.map(|(k, v)| (k.into_owned(), v.into_owned())),
			);
		}
		let is_form_post = parts.method == Method::POST
			&& parts
				.headers
				.get(http::header::CONTENT_TYPE)
				.and_then(|v| v.to_str().ok())
				.is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
		if is_form_post {
			let bytes = body.collect().await?.to_bytes();
			fields.extend(
				url::form_urlencoded::parse(&bytes).map(|(k, v)| (k.into_owned(), v.into_owned())),
			);
		}
		Ok(Self(fields))
	}

	pub(crate) fn get(&self, name: &str) -> &str {
		self
			.0
			.iter()
			.find_map(|(k, v)| (k == name).then_some(v.as_str()))
			.unwrap_or("")
	}
}

/// The open-redirect guard: anything but a single-slash absolute path
/// collapses to `/`.
pub(crate) fn sanitize_redirect(redirect: &str) -> &str {
	if redirect.starts_with('/') && !redirect.starts_with("//") {
		redirect
	} else {
		"/"
	}
}

fn host_of(parts: &Parts) -> String {
	if let Some(host) = parts.headers.get(http::header::HOST)
		&& let Ok(host) = host.to_str()
	{
		return host.to_string();
	}
	parts
		.uri
		.authority()
		.map(|a| a.as_str().to_string())
		.unwrap_or_default()
}

fn request_uri(parts: &Parts) -> String {
	parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str().to_string())
		.unwrap_or_else(|| "/".to_string())
}

fn with_headers(mut response: Response<Body>, headers: HeaderMap) -> Response<Body> {
	for (name, value) in headers.iter() {
		if name == &SET_COOKIE {
			response.headers_mut().append(name, value.clone());
		} else {
			response.headers_mut().insert(name, value.clone());
		}
	}
	response
}

impl OAuthProxy {
	pub(crate) fn error_page(
		&self,
		code: StatusCode,
		title: &str,
		message: &str,
	) -> Response<Body> {
		info!(code = code.as_u16(), title, message, "rendering error page");
		let body = self
			.pages
			.error(code, title, message, &self.config.proxy_prefix);
		html(code, body)
	}

	/// The redirect target the current request is asking to return to after
	/// sign-in.
	fn get_redirect(&self, parts: &Parts, form: &Form) -> String {
		let redirect = if !self.config.skip_provider_button {
			form.get("rd").to_string()
		} else if let Some(header) = parts.headers.get("x-auth-request-redirect") {
			header.to_str().unwrap_or("").to_string()
		} else {
			request_uri(parts)
		};
		sanitize_redirect(&redirect).to_string()
	}

	/// Render the sign-in page. Clears any session cookie and, when the
	/// htpasswd form is shown, arms the CSRF cookie that the form token must
	/// match.
	pub(crate) fn sign_in_page(&self, parts: &Parts, form: &Form, code: StatusCode) -> Response<Body> {
		let host = host_of(parts);
		let mut headers = HeaderMap::new();
		self.clear_session_cookie(&mut headers, &host);

		// Keep the page pointed at wherever the user was headed: explicit
		// `rd`, then the gateway-supplied redirect header, then the request
		// itself.
		let mut redirect = form.get("rd").to_string();
		if redirect.is_empty() {
			redirect = parts
				.headers
				.get("x-auth-request-redirect")
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
				.unwrap_or_else(|| request_uri(parts));
		}
		let mut redirect = sanitize_redirect(&redirect).to_string();
		if redirect == self.sign_in_path {
			redirect = "/".to_string();
		}

		let custom_login = self.display_htpasswd_form();
		let mut csrf_token = String::new();
		if custom_login {
			match cookies::nonce() {
				Ok(nonce) => {
					self.set_csrf_cookie(&mut headers, &host, &nonce);
					csrf_token = nonce;
				},
				Err(err) => {
					warn!(error = %err, "failed to generate sign-in form token");
					return with_headers(
						self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", "Internal Error"),
						headers,
					);
				},
			}
		}

		let body = self.pages.sign_in(&SignInData {
			provider_name: &self.provider.data().provider_name,
			sign_in_message: &self.config.sign_in_message,
			custom_login,
			redirect: &redirect,
			csrf_token: &csrf_token,
			proxy_prefix: &self.config.proxy_prefix,
			footer: &self.config.footer,
			version: VERSION,
		});
		with_headers(html(code, body), headers)
	}

	/// POST credential check against the htpasswd file, guarded by the form
	/// token issued with the page.
	fn manual_sign_in(&self, req_cookie: Option<String>, form: &Form) -> ManualSignIn {
		let Some(htpasswd) = &self.htpasswd else {
			return ManualSignIn::NotAttempted;
		};
		let user = form.get("username");
		if user.is_empty() {
			return ManualSignIn::NotAttempted;
		}

		let form_token = form.get("csrf_token");
		let cookie_token = req_cookie.unwrap_or_default();
		if form_token.is_empty()
			|| cookie_token.is_empty()
			|| !constant_time_eq(form_token, &cookie_token)
		{
			return ManualSignIn::CsrfMismatch;
		}

		if htpasswd.validate(user, form.get("password")) {
			info!(user, "authenticated via htpasswd file");
			ManualSignIn::Authenticated(user.to_string())
		} else {
			ManualSignIn::BadCredentials
		}
	}

	pub(crate) async fn sign_in(&self, req: Request<Body>) -> Response<Body> {
		let csrf_cookie = self.request_cookie(&req, &self.csrf_cookie_name);
		let (parts, body) = req.into_parts();
		let form = match Form::parse(&parts, body).await {
			Ok(form) => form,
			Err(err) => {
				return self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", &err.to_string());
			},
		};
		let redirect_target = self.get_redirect(&parts, &form);
		let host = host_of(&parts);

		if parts.method == Method::POST {
			match self.manual_sign_in(csrf_cookie, &form) {
				ManualSignIn::Authenticated(user) => {
					let mut headers = HeaderMap::new();
					self.clear_csrf_cookie(&mut headers, &host);
					let session = SessionState {
						user,
						..Default::default()
					};
					if let Err(err) = self.save_session(&mut headers, &host, &session) {
						warn!(error = %err, "failed to save session after manual sign-in");
						return self.error_page(
							StatusCode::INTERNAL_SERVER_ERROR,
							"Internal Error",
							"Internal Error",
						);
					}
					return with_headers(redirect(&redirect_target), headers);
				},
				ManualSignIn::CsrfMismatch => {
					let mut headers = HeaderMap::new();
					self.clear_csrf_cookie(&mut headers, &host);
					info!("sign-in form token mismatch");
					return with_headers(
						self.error_page(StatusCode::FORBIDDEN, "Permission Denied", "csrf failed"),
						headers,
					);
				},
				ManualSignIn::BadCredentials | ManualSignIn::NotAttempted => {},
			}
		}

		self.sign_in_page(&parts, &form, StatusCode::OK)
	}

	pub(crate) async fn sign_out(&self, req: Request<Body>) -> Response<Body> {
		let (parts, _body) = req.into_parts();
		let host = host_of(&parts);
		let mut headers = HeaderMap::new();
		self.clear_session_cookie(&mut headers, &host);
		with_headers(redirect("/"), headers)
	}

	/// Arm the CSRF cookie and bounce the browser to the provider's login
	/// URL with the nonce and sanitized redirect bound into `state`.
	pub(crate) async fn oauth_start(&self, req: Request<Body>) -> Response<Body> {
		let (parts, body) = req.into_parts();
		let nonce = match cookies::nonce() {
			Ok(nonce) => nonce,
			Err(err) => {
				return self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", &err.to_string());
			},
		};
		let form = match Form::parse(&parts, body).await {
			Ok(form) => form,
			Err(err) => {
				return self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", &err.to_string());
			},
		};
		let host = host_of(&parts);
		let mut headers = HeaderMap::new();
		self.set_csrf_cookie(&mut headers, &host, &nonce);

		let redirect_target = self.get_redirect(&parts, &form);
		let Some(redirect_uri) = self.get_redirect_uri(&host) else {
			return self.error_page(
				StatusCode::INTERNAL_SERVER_ERROR,
				"Internal Error",
				"could not construct redirect URL",
			);
		};
		let state = format!("{nonce}:{redirect_target}");
		let login_url = self.provider.get_login_url(&redirect_uri, &state);
		with_headers(redirect(login_url.as_str()), headers)
	}

	async fn redeem_code(&self, host: &str, code: &str) -> anyhow::Result<SessionState> {
		let redirect_uri = self
			.get_redirect_uri(host)
			.ok_or_else(|| anyhow::anyhow!("could not construct redirect URL"))?;
		let mut session = self.provider.redeem(&redirect_uri, code).await?;
		if session.email.is_empty() {
			session.email = self.provider.get_email_address(&session).await?;
		}
		Ok(session)
	}

	/// Finish the authorization-code dance: provider error passthrough, code
	/// redemption, state unpacking, CSRF check (cookie cleared no matter
	/// what), then the authorization gate.
	pub(crate) async fn oauth_callback(&self, req: Request<Body>) -> Response<Body> {
		let remote = remote_addr(&req);
		let csrf_cookie = self.request_cookie(&req, &self.csrf_cookie_name);
		let (parts, body) = req.into_parts();
		let host = host_of(&parts);

		// One-shot nonce: whatever happens below, the CSRF cookie does not
		// survive the callback.
		let mut headers = HeaderMap::new();
		if csrf_cookie.is_some() {
			self.clear_csrf_cookie(&mut headers, &host);
		}

		let form = match Form::parse(&parts, body).await {
			Ok(form) => form,
			Err(err) => {
				return with_headers(
					self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", &err.to_string()),
					headers,
				);
			},
		};

		let provider_error = form.get("error");
		if !provider_error.is_empty() {
			return with_headers(
				self.error_page(StatusCode::FORBIDDEN, "Permission Denied", provider_error),
				headers,
			);
		}

		let session = match self
			.redeem_code(&host, form.get(&self.config.callback_code_param))
			.await
		{
			Ok(session) => session,
			Err(err) => {
				info!(remote = %remote, error = %err, "error redeeming code");
				return with_headers(
					self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", "Internal Error"),
					headers,
				);
			},
		};

		let state = form.get("state");
		let Some((nonce, redirect_target)) = state.split_once(':') else {
			return with_headers(
				self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", "Invalid State"),
				headers,
			);
		};

		let Some(cookie_nonce) = csrf_cookie else {
			return self.error_page(
				StatusCode::FORBIDDEN,
				"Permission Denied",
				&format!("cookie {:?} not present", self.csrf_cookie_name),
			);
		};

		if !constant_time_eq(&cookie_nonce, nonce) {
			warn!(remote = %remote, "csrf token mismatch, potential attack");
			return with_headers(
				self.error_page(StatusCode::FORBIDDEN, "Permission Denied", "csrf failed"),
				headers,
			);
		}

		let redirect_target = sanitize_redirect(redirect_target);

		if self.validate_email(&session.email) && self.provider.validate_group(&session.email) {
			info!(remote = %remote, session = %session, "authentication complete");
			if let Err(err) = self.save_session(&mut headers, &host, &session) {
				warn!(remote = %remote, error = %err, "failed to save session");
				return with_headers(
					self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", "Internal Error"),
					headers,
				);
			}
			with_headers(redirect(redirect_target), headers)
		} else {
			info!(remote = %remote, email = %session.email, "permission denied, unauthorized account");
			with_headers(
				self.error_page(StatusCode::FORBIDDEN, "Permission Denied", "Invalid Account"),
				headers,
			)
		}
	}

	/// Gateway auth sub-request endpoint: 202 when authenticated, 401
	/// otherwise.
	pub(crate) async fn authenticate_only(&self, mut req: Request<Body>) -> Response<Body> {
		let outcome = self.authenticate(&mut req).await;
		let response = match outcome.decision {
			AuthDecision::Accepted => plain(StatusCode::ACCEPTED, ""),
			_ => plain(StatusCode::UNAUTHORIZED, "unauthorized request\n"),
		};
		with_headers(response, outcome.response_headers)
	}

	/// Authenticate-and-forward, the default route. Forbidden requests see
	/// the sign-in page (or go straight to the provider when the button is
	/// skipped).
	pub(crate) async fn proxy_request(&self, mut req: Request<Body>) -> Response<Body> {
		let outcome = self.authenticate(&mut req).await;
		match outcome.decision {
			AuthDecision::InternalError => with_headers(
				self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", "Internal Error"),
				outcome.response_headers,
			),
			AuthDecision::Forbidden => {
				if self.config.skip_provider_button {
					return with_headers(self.oauth_start(req).await, outcome.response_headers);
				}
				let (parts, body) = req.into_parts();
				let form = match Form::parse(&parts, body).await {
					Ok(form) => form,
					Err(_) => Form(vec![]),
				};
				with_headers(
					self.sign_in_page(&parts, &form, StatusCode::FORBIDDEN),
					outcome.response_headers,
				)
			},
			AuthDecision::Accepted => {
				let gap_auth = outcome
					.response_headers
					.get(crate::upstream::GAP_AUTH_HEADER)
					.cloned();
				let response = self.upstreams.dispatch(req, gap_auth).await;
				with_headers(response, outcome.response_headers)
			},
		}
	}
}

enum ManualSignIn {
	Authenticated(String),
	BadCredentials,
	CsrfMismatch,
	NotAttempted,
}
