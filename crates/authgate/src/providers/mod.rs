mod keyset;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, RedirectUrl, Scope};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use url::Url;

pub use keyset::KeysetProvider;

use crate::cookies::CookieCipher;
use crate::session::{SessionError, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
	#[error("missing code")]
	MissingCode,
	#[error("token endpoint request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("provider returned status {0}")]
	Status(u16),
	#[error("provider response missing {0}")]
	MissingField(&'static str),
	#[error("no access token set")]
	NoAccessToken,
	#[error("token verification failed: {0}")]
	TokenVerification(String),
	#[error("provider does not expose a profile endpoint")]
	NoProfileEndpoint,
}

/// Endpoint and client metadata shared by every provider implementation.
#[derive(Debug)]
pub struct ProviderData {
	pub provider_name: String,
	pub login_url: Url,
	pub redeem_url: Url,
	pub profile_url: Option<Url>,
	pub validate_url: Option<Url>,
	pub scope: String,
	pub client_id: String,
	pub client_secret: SecretString,
	pub approval_prompt: String,
}

/// The identity-provider capability set. Stateless except for key caches;
/// one instance serves the whole process.
#[async_trait]
pub trait Provider: Send + Sync {
	fn data(&self) -> &ProviderData;

	/// Browser-redirect URL for the start of the authorization flow.
	fn get_login_url(&self, redirect_uri: &Url, state: &str) -> Url {
		let data = self.data();
		let client = BasicClient::new(ClientId::new(data.client_id.clone()))
			.set_auth_uri(AuthUrl::from_url(data.login_url.clone()))
			.set_redirect_uri(RedirectUrl::from_url(redirect_uri.clone()));
		let mut request = client
			.authorize_url(|| CsrfToken::new(state.to_string()))
			.add_extra_param("approval_prompt", data.approval_prompt.clone());
		if !data.scope.is_empty() {
			request = request.add_scope(Scope::new(data.scope.clone()));
		}
		let (url, _state) = request.url();
		url
	}

	/// Exchange an authorization code for tokens.
	async fn redeem(&self, redirect_uri: &Url, code: &str) -> Result<SessionState, ProviderError>;

	/// Resolve the user-identifying email for a session.
	async fn get_email_address(&self, session: &SessionState) -> Result<String, ProviderError>;

	/// Authorization hook for group/org membership checks.
	fn validate_group(&self, _email: &str) -> bool {
		true
	}

	/// Check the access token is still live against the validate endpoint.
	async fn validate_session_state(&self, session: &SessionState) -> bool;

	/// Renew the access token when it is due. `Ok(false)` when not due,
	/// `Ok(true)` when renewed.
	async fn refresh_session_if_needed(
		&self,
		session: &mut SessionState,
	) -> Result<bool, ProviderError>;

	fn cookie_for_session(
		&self,
		session: &SessionState,
		cipher: Option<&CookieCipher>,
	) -> Result<String, SessionError> {
		session.encode(cipher)
	}

	fn session_from_cookie(
		&self,
		value: &str,
		cipher: Option<&CookieCipher>,
	) -> Result<SessionState, SessionError> {
		SessionState::decode(value, cipher)
	}
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: Option<String>,
	refresh_token: Option<String>,
	expires_in: Option<u64>,
	id_token: Option<String>,
}

/// Plain OAuth2 provider driven entirely by the configured endpoint set.
pub struct GenericProvider {
	data: ProviderData,
	http: reqwest::Client,
}

impl GenericProvider {
	pub fn new(data: ProviderData) -> Self {
		Self {
			data,
			http: default_http_client(),
		}
	}
}

pub(crate) fn default_http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.timeout(Duration::from_secs(30))
		.build()
		.unwrap_or_default()
}

#[async_trait]
impl Provider for GenericProvider {
	fn data(&self) -> &ProviderData {
		&self.data
	}

	async fn redeem(&self, redirect_uri: &Url, code: &str) -> Result<SessionState, ProviderError> {
		redeem_code(&self.http, &self.data, redirect_uri, code).await
	}

	async fn get_email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
		profile_email(&self.http, &self.data, session).await
	}

	async fn validate_session_state(&self, session: &SessionState) -> bool {
		validate_token(&self.http, &self.data, session).await
	}

	async fn refresh_session_if_needed(
		&self,
		session: &mut SessionState,
	) -> Result<bool, ProviderError> {
		refresh_if_needed(&self.http, &self.data, session).await
	}
}

/// Shared redemption path: POST the code grant, accept a JSON token response
/// or a form-encoded `access_token` body.
pub(crate) async fn redeem_code(
	http: &reqwest::Client,
	data: &ProviderData,
	redirect_uri: &Url,
	code: &str,
) -> Result<SessionState, ProviderError> {
	if code.is_empty() {
		return Err(ProviderError::MissingCode);
	}
	let params = [
		("redirect_uri", redirect_uri.as_str()),
		("client_id", &data.client_id),
		("client_secret", data.client_secret.expose_secret()),
		("code", code),
		("grant_type", "authorization_code"),
	];
	let response = http.post(data.redeem_url.clone()).form(&params).send().await?;
	let status = response.status();
	let body = response.text().await?;
	if !status.is_success() {
		debug!(status = status.as_u16(), "code redemption rejected");
		return Err(ProviderError::Status(status.as_u16()));
	}

	if let Ok(token) = serde_json::from_str::<TokenResponse>(&body) {
		let access_token = token
			.access_token
			.filter(|t| !t.is_empty())
			.ok_or(ProviderError::MissingField("access_token"))?;
		let email = token
			.id_token
			.as_deref()
			.and_then(email_from_id_token)
			.unwrap_or_default();
		return Ok(SessionState {
			email,
			access_token,
			refresh_token: token.refresh_token.unwrap_or_default(),
			expires_on: token
				.expires_in
				.map(|secs| SystemTime::now() + Duration::from_secs(secs)),
			..Default::default()
		});
	}

	// Some token endpoints still answer with a form-encoded body.
	let access_token = url::form_urlencoded::parse(body.as_bytes())
		.find_map(|(k, v)| (k == "access_token").then(|| v.into_owned()))
		.filter(|t| !t.is_empty())
		.ok_or(ProviderError::MissingField("access_token"))?;
	Ok(SessionState {
		access_token,
		..Default::default()
	})
}

/// Best-effort email from an unverified id_token payload. Authorization still
/// goes through the validator, so a forged claim only names an identity the
/// validator must independently accept.
fn email_from_id_token(id_token: &str) -> Option<String> {
	#[derive(Deserialize)]
	struct IdClaims {
		email: Option<String>,
	}
	let payload = id_token.split('.').nth(1)?;
	let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
	let claims: IdClaims = serde_json::from_slice(&decoded).ok()?;
	claims.email.filter(|e| !e.is_empty())
}

pub(crate) async fn profile_email(
	http: &reqwest::Client,
	data: &ProviderData,
	session: &SessionState,
) -> Result<String, ProviderError> {
	if session.access_token.is_empty() {
		return Err(ProviderError::NoAccessToken);
	}
	let Some(profile_url) = &data.profile_url else {
		return Err(ProviderError::NoProfileEndpoint);
	};

	#[derive(Deserialize)]
	struct Profile {
		email: Option<String>,
	}
	let response = http
		.get(profile_url.clone())
		.bearer_auth(&session.access_token)
		.send()
		.await?;
	let status = response.status();
	if !status.is_success() {
		return Err(ProviderError::Status(status.as_u16()));
	}
	let profile: Profile = response.json().await?;
	profile
		.email
		.filter(|e| !e.is_empty())
		.ok_or(ProviderError::MissingField("email"))
}

pub(crate) async fn validate_token(
	http: &reqwest::Client,
	data: &ProviderData,
	session: &SessionState,
) -> bool {
	if session.access_token.is_empty() {
		return false;
	}
	let Some(validate_url) = &data.validate_url else {
		return false;
	};
	let mut url = validate_url.clone();
	url
		.query_pairs_mut()
		.append_pair("access_token", &session.access_token);
	match http.get(url).send().await {
		Ok(response) => {
			let ok = response.status().is_success();
			if !ok {
				debug!(status = response.status().as_u16(), "token validation failed");
			}
			ok
		},
		Err(err) => {
			debug!(error = %err, "token validation request failed");
			false
		},
	}
}

pub(crate) async fn refresh_if_needed(
	http: &reqwest::Client,
	data: &ProviderData,
	session: &mut SessionState,
) -> Result<bool, ProviderError> {
	let due = match session.expires_on {
		Some(expires) => expires <= SystemTime::now(),
		None => false,
	};
	if !due || session.refresh_token.is_empty() {
		return Ok(false);
	}

	let params = [
		("client_id", data.client_id.as_str()),
		("client_secret", data.client_secret.expose_secret()),
		("refresh_token", &session.refresh_token),
		("grant_type", "refresh_token"),
	];
	let response = http.post(data.redeem_url.clone()).form(&params).send().await?;
	let status = response.status();
	if !status.is_success() {
		return Err(ProviderError::Status(status.as_u16()));
	}
	let token: TokenResponse = response.json().await?;
	session.access_token = token
		.access_token
		.filter(|t| !t.is_empty())
		.ok_or(ProviderError::MissingField("access_token"))?;
	if let Some(refresh_token) = token.refresh_token.filter(|t| !t.is_empty()) {
		session.refresh_token = refresh_token;
	}
	let expires_in = token.expires_in.unwrap_or(3600);
	session.expires_on = Some(SystemTime::now() + Duration::from_secs(expires_in));
	debug!(session = %session, "refreshed access token");
	Ok(true)
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{body_string_contains, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn test_data(base: &str) -> ProviderData {
		ProviderData {
			provider_name: "Test".to_string(),
			login_url: format!("{base}/authorize").parse().unwrap(),
			redeem_url: format!("{base}/token").parse().unwrap(),
			profile_url: Some(format!("{base}/profile").parse().unwrap()),
			validate_url: Some(format!("{base}/validate").parse().unwrap()),
			scope: "profile email".to_string(),
			client_id: "client-id".to_string(),
			client_secret: SecretString::from("client-secret".to_string()),
			approval_prompt: "force".to_string(),
		}
	}

	#[test]
	fn login_url_carries_state_and_redirect() {
		let provider = GenericProvider::new(test_data("https://idp.example.com"));
		let redirect: Url = "https://app.example.com/oauth2/callback".parse().unwrap();
		let url = provider.get_login_url(&redirect, "NONCE:/app");

		let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
		assert!(url.as_str().starts_with("https://idp.example.com/authorize?"));
		assert!(pairs.contains(&("state".to_string(), "NONCE:/app".to_string())));
		assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
		assert!(pairs.contains(&("client_id".to_string(), "client-id".to_string())));
		assert!(pairs.contains(&(
			"redirect_uri".to_string(),
			"https://app.example.com/oauth2/callback".to_string()
		)));
		assert!(pairs.contains(&("scope".to_string(), "profile email".to_string())));
		assert!(pairs.contains(&("approval_prompt".to_string(), "force".to_string())));
	}

	#[tokio::test]
	async fn redeem_parses_json_token_response() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("grant_type=authorization_code"))
			.and(body_string_contains("code=good"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"access_token": "at-1",
				"refresh_token": "rt-1",
				"expires_in": 3600,
			})))
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let redirect: Url = "https://app.example.com/oauth2/callback".parse().unwrap();
		let session = provider.redeem(&redirect, "good").await.unwrap();
		assert_eq!(session.access_token, "at-1");
		assert_eq!(session.refresh_token, "rt-1");
		assert!(session.expires_on.is_some());
	}

	#[tokio::test]
	async fn redeem_parses_form_encoded_response() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(
				ResponseTemplate::new(200).set_body_string("access_token=at-2&token_type=bearer"),
			)
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let redirect: Url = "https://app.example.com/oauth2/callback".parse().unwrap();
		let session = provider.redeem(&redirect, "good").await.unwrap();
		assert_eq!(session.access_token, "at-2");
	}

	#[tokio::test]
	async fn redeem_rejects_empty_code_without_network() {
		let provider = GenericProvider::new(test_data("https://idp.example.com"));
		let redirect: Url = "https://app.example.com/cb".parse().unwrap();
		assert!(matches!(
			provider.redeem(&redirect, "").await,
			Err(ProviderError::MissingCode)
		));
	}

	#[tokio::test]
	async fn redeem_surfaces_error_status() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(403))
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let redirect: Url = "https://app.example.com/cb".parse().unwrap();
		assert!(matches!(
			provider.redeem(&redirect, "bad").await,
			Err(ProviderError::Status(403))
		));
	}

	#[tokio::test]
	async fn profile_email_uses_bearer_token() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/profile"))
			.and(wiremock::matchers::header("authorization", "Bearer at-1"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(serde_json::json!({"email": "frank@example.com"})),
			)
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let session = SessionState {
			access_token: "at-1".to_string(),
			..Default::default()
		};
		assert_eq!(
			provider.get_email_address(&session).await.unwrap(),
			"frank@example.com"
		);
	}

	#[tokio::test]
	async fn validate_session_state_checks_validate_url() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/validate"))
			.and(wiremock::matchers::query_param("access_token", "live"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let live = SessionState {
			access_token: "live".to_string(),
			..Default::default()
		};
		assert!(provider.validate_session_state(&live).await);

		let empty = SessionState::default();
		assert!(!provider.validate_session_state(&empty).await);
	}

	#[tokio::test]
	async fn refresh_skips_sessions_that_are_not_due() {
		let provider = GenericProvider::new(test_data("https://idp.example.com"));
		let mut session = SessionState {
			access_token: "at".to_string(),
			refresh_token: "rt".to_string(),
			expires_on: Some(SystemTime::now() + Duration::from_secs(600)),
			..Default::default()
		};
		assert!(!provider.refresh_session_if_needed(&mut session).await.unwrap());
	}

	#[tokio::test]
	async fn refresh_renews_expired_session() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("grant_type=refresh_token"))
			.and(body_string_contains("refresh_token=rt-old"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"access_token": "at-new",
				"expires_in": 60,
			})))
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let mut session = SessionState {
			email: "frank@example.com".to_string(),
			access_token: "at-old".to_string(),
			refresh_token: "rt-old".to_string(),
			expires_on: Some(SystemTime::now() - Duration::from_secs(5)),
			..Default::default()
		};
		assert!(provider.refresh_session_if_needed(&mut session).await.unwrap());
		assert_eq!(session.access_token, "at-new");
		assert_eq!(session.refresh_token, "rt-old");
		assert!(!session.is_expired());
	}

	#[tokio::test]
	async fn refresh_failure_is_an_error() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(400))
			.mount(&server)
			.await;

		let provider = GenericProvider::new(test_data(&server.uri()));
		let mut session = SessionState {
			refresh_token: "rt".to_string(),
			expires_on: Some(SystemTime::now() - Duration::from_secs(5)),
			..Default::default()
		};
		assert!(provider.refresh_session_if_needed(&mut session).await.is_err());
	}

	#[test]
	fn email_from_id_token_reads_payload_claim() {
		let payload = URL_SAFE_NO_PAD.encode(br#"{"email":"frank@example.com"}"#);
		let token = format!("header.{payload}.signature");
		assert_eq!(
			email_from_id_token(&token).as_deref(),
			Some("frank@example.com")
		);
		assert_eq!(email_from_id_token("not-a-jwt"), None);
	}
}
