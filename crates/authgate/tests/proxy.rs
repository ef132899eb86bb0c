use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use http::header::{HeaderValue, SET_COOKIE};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use secrecy::SecretString;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authgate::config::ProxyConfig;
use authgate::providers::{Provider, ProviderData, ProviderError};
use authgate::proxy::OAuthProxy;
use authgate::session::SessionState;
use authgate::{Body, cookies, full};

const COOKIE_SECRET: &str = "0123456789abcdef";

struct TestProvider {
	data: ProviderData,
}

impl TestProvider {
	fn new() -> Self {
		Self {
			data: ProviderData {
				provider_name: "TestIdP".to_string(),
				login_url: "https://idp.example.com/authorize".parse().unwrap(),
				redeem_url: "https://idp.example.com/token".parse().unwrap(),
				profile_url: None,
				validate_url: None,
				scope: "profile email".to_string(),
				client_id: "client-id".to_string(),
				client_secret: SecretString::from("client-secret".to_string()),
				approval_prompt: "force".to_string(),
			},
		}
	}
}

#[async_trait]
impl Provider for TestProvider {
	fn data(&self) -> &ProviderData {
		&self.data
	}

	async fn redeem(&self, _redirect_uri: &Url, code: &str) -> Result<SessionState, ProviderError> {
		match code {
			"good" => Ok(SessionState {
				email: "u@ex.com".to_string(),
				access_token: "at-1".to_string(),
				..Default::default()
			}),
			"outsider" => Ok(SessionState {
				email: "u@other.com".to_string(),
				access_token: "at-2".to_string(),
				..Default::default()
			}),
			_ => Err(ProviderError::Status(403)),
		}
	}

	async fn get_email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
		match session.access_token.as_str() {
			"bearer-ok" => Ok("u@ex.com".to_string()),
			_ => Err(ProviderError::TokenVerification("unknown token".to_string())),
		}
	}

	async fn validate_session_state(&self, _session: &SessionState) -> bool {
		true
	}

	async fn refresh_session_if_needed(
		&self,
		_session: &mut SessionState,
	) -> Result<bool, ProviderError> {
		Ok(false)
	}
}

fn test_config(upstream: &str) -> ProxyConfig {
	ProxyConfig {
		cookie_secret: SecretString::from(COOKIE_SECRET.to_string()),
		cookie_secure: false,
		upstreams: vec![format!("{upstream}/").parse().unwrap()],
		..Default::default()
	}
}

fn build_proxy(config: ProxyConfig) -> Arc<OAuthProxy> {
	let validator = authgate::validator::new(vec!["ex.com".to_string()], None).unwrap();
	Arc::new(OAuthProxy::new(config, Arc::new(TestProvider::new()), validator, None).unwrap())
}

async fn proxy_with_upstream() -> (Arc<OAuthProxy>, MockServer) {
	let upstream = MockServer::start().await;
	let proxy = build_proxy(test_config(&upstream.uri()));
	(proxy, upstream)
}

fn get(uri: &str) -> Request<Body> {
	Request::builder()
		.method("GET")
		.uri(uri)
		.header("Host", "app.example.com")
		.body(authgate::empty())
		.unwrap()
}

fn set_cookies<'a>(response: &'a http::Response<Body>) -> Vec<&'a str> {
	response
		.headers()
		.get_all(SET_COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.collect()
}

fn cookie_value<'a>(set_cookies: &[&'a str], name: &str) -> Option<&'a str> {
	set_cookies.iter().find_map(|c| {
		let (pair, _attrs) = c.split_once(';')?;
		let (cookie_name, value) = pair.split_once('=')?;
		(cookie_name == name).then_some(value)
	})
}

fn session_cookie_header() -> String {
	let session = SessionState {
		email: "u@ex.com".to_string(),
		..Default::default()
	};
	let value = session.encode(None).unwrap();
	let sealed = cookies::sign_value(COOKIE_SECRET, "_authgate", &value, SystemTime::now());
	format!("_authgate={sealed}")
}

async fn body_string(response: http::Response<Body>) -> String {
	let bytes = response.into_body().collect().await.unwrap().to_bytes();
	String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn ping_returns_ok_without_cookies() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let response = proxy.serve(get("/ping")).await;
	assert_eq!(response.status(), StatusCode::OK);
	assert!(set_cookies(&response).is_empty());
	assert_eq!(body_string(response).await, "OK");
}

#[tokio::test]
async fn robots_txt_disallows_everything() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let response = proxy.serve(get("/robots.txt")).await;
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_string(response).await, "User-agent: *\nDisallow: /");
}

#[tokio::test]
async fn unauthenticated_request_renders_sign_in_page() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let response = proxy.serve(get("/foo")).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
	// Only an expired empty session cookie may be present.
	let cookies = set_cookies(&response);
	if let Some(value) = cookie_value(&cookies, "_authgate") {
		assert!(value.is_empty());
	}
	let body = body_string(response).await;
	assert!(body.contains("Sign in with TestIdP"));
}

#[tokio::test]
async fn oauth_start_sets_csrf_cookie_and_binds_state() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let response = proxy.serve(get("/oauth2/start?rd=%2Fapp")).await;
	assert_eq!(response.status(), StatusCode::FOUND);

	let cookies = set_cookies(&response);
	let nonce = cookie_value(&cookies, "_authgate_csrf")
		.expect("csrf cookie must be set")
		.to_string();
	assert!(!nonce.is_empty());

	let location = response
		.headers()
		.get(http::header::LOCATION)
		.unwrap()
		.to_str()
		.unwrap();
	assert!(location.starts_with("https://idp.example.com/authorize?"));
	let location: Url = location.parse().unwrap();
	let state = location
		.query_pairs()
		.find_map(|(k, v)| (k == "state").then(|| v.into_owned()))
		.unwrap();
	assert_eq!(state, format!("{nonce}:/app"));
	let redirect_uri = location
		.query_pairs()
		.find_map(|(k, v)| (k == "redirect_uri").then(|| v.into_owned()))
		.unwrap();
	assert_eq!(redirect_uri, "http://app.example.com/oauth2/callback");
}

#[tokio::test]
async fn callback_with_matching_nonce_saves_session_and_redirects() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/callback?code=good&state=NONCE:/app")
		.header("Host", "app.example.com")
		.header("Cookie", "_authgate_csrf=NONCE")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FOUND);
	assert_eq!(
		response.headers().get(http::header::LOCATION).unwrap(),
		"/app"
	);

	let cookies = set_cookies(&response);
	let session_value = cookie_value(&cookies, "_authgate").expect("session cookie must be set");
	assert!(!session_value.is_empty());
	let csrf_value = cookie_value(&cookies, "_authgate_csrf").expect("csrf cookie must be cleared");
	assert!(csrf_value.is_empty());
}

#[tokio::test]
async fn callback_with_wrong_nonce_is_denied_and_clears_csrf() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/callback?code=good&state=WRONG:/app")
		.header("Host", "app.example.com")
		.header("Cookie", "_authgate_csrf=NONCE")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);

	let cookies = set_cookies(&response);
	assert!(cookie_value(&cookies, "_authgate").is_none());
	let csrf_value = cookie_value(&cookies, "_authgate_csrf").expect("csrf cookie must be cleared");
	assert!(csrf_value.is_empty());
}

#[tokio::test]
async fn callback_without_csrf_cookie_is_denied() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/callback?code=good&state=NONCE:/app")
		.header("Host", "app.example.com")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn callback_rejects_unauthorized_account() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/callback?code=outsider&state=NONCE:/app")
		.header("Host", "app.example.com")
		.header("Cookie", "_authgate_csrf=NONCE")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
	let cookies = set_cookies(&response);
	assert!(cookie_value(&cookies, "_authgate").is_none());
	let body = body_string(response).await;
	assert!(body.contains("Invalid Account"));
}

#[tokio::test]
async fn callback_with_malformed_state_is_an_internal_error() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/callback?code=good&state=no-separator")
		.header("Host", "app.example.com")
		.header("Cookie", "_authgate_csrf=NONCE")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	let body = body_string(response).await;
	assert!(body.contains("Invalid State"));
}

#[tokio::test]
async fn callback_passes_provider_error_through_as_denied() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/callback?error=access_denied")
		.header("Host", "app.example.com")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
	let body = body_string(response).await;
	assert!(body.contains("access_denied"));
}

#[tokio::test]
async fn authenticated_request_reaches_upstream_with_identity_headers() {
	let (proxy, upstream) = proxy_with_upstream().await;
	Mock::given(method("GET"))
		.and(path("/app"))
		.and(header("x-forwarded-email", "u@ex.com"))
		.respond_with(ResponseTemplate::new(200).set_body_string("upstream ok"))
		.expect(1)
		.mount(&upstream)
		.await;

	let request = Request::builder()
		.method("GET")
		.uri("/app")
		.header("Host", "app.example.com")
		.header("Cookie", session_cookie_header())
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(
		response.headers().get("GAP-Auth").unwrap(),
		&HeaderValue::from_static("u@ex.com")
	);
	assert!(response.headers().contains_key("GAP-Upstream-Address"));
	assert_eq!(body_string(response).await, "upstream ok");
}

#[tokio::test]
async fn preflight_skip_forwards_options_without_auth() {
	let upstream = MockServer::start().await;
	Mock::given(method("OPTIONS"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&upstream)
		.await;

	let mut config = test_config(&upstream.uri());
	config.skip_auth_preflight = true;
	let proxy = build_proxy(config);

	let request = Request::builder()
		.method("OPTIONS")
		.uri("/anything")
		.header("Host", "app.example.com")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn whitelisted_path_bypasses_authentication() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/public/info"))
		.respond_with(ResponseTemplate::new(200).set_body_string("public"))
		.mount(&upstream)
		.await;

	let mut config = test_config(&upstream.uri());
	config.skip_auth_regex = vec!["^/public/".to_string()];
	let proxy = build_proxy(config);

	let response = proxy.serve(get("/public/info")).await;
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_string(response).await, "public");
}

#[tokio::test]
async fn bearer_auth_reaches_upstream_without_session_cookie() {
	let (proxy, upstream) = proxy_with_upstream().await;
	Mock::given(method("GET"))
		.and(path("/app"))
		.respond_with(ResponseTemplate::new(200).set_body_string("upstream ok"))
		.mount(&upstream)
		.await;

	let request = Request::builder()
		.method("GET")
		.uri("/app")
		.header("Host", "app.example.com")
		.header("Authorization", "Bearer bearer-ok")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::OK);
	assert!(set_cookies(&response).is_empty());
	assert_eq!(response.headers().get("GAP-Auth").unwrap(), "u@ex.com");
}

#[tokio::test]
async fn invalid_bearer_token_renders_sign_in() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let request = Request::builder()
		.method("GET")
		.uri("/app")
		.header("Host", "app.example.com")
		.header("Authorization", "Bearer bogus")
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn auth_endpoint_answers_202_or_401() {
	let (proxy, _upstream) = proxy_with_upstream().await;

	let request = Request::builder()
		.method("GET")
		.uri("/oauth2/auth")
		.header("Host", "app.example.com")
		.header("Cookie", session_cookie_header())
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::ACCEPTED);

	let response = proxy.serve(get("/oauth2/auth")).await;
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	assert_eq!(body_string(response).await, "unauthorized request\n");
}

#[tokio::test]
async fn sign_out_clears_the_session_cookie() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let response = proxy.serve(get("/oauth2/sign_out")).await;
	assert_eq!(response.status(), StatusCode::FOUND);
	assert_eq!(response.headers().get(http::header::LOCATION).unwrap(), "/");
	let cookies = set_cookies(&response);
	assert_eq!(cookie_value(&cookies, "_authgate"), Some(""));
}

#[tokio::test]
async fn rejected_session_from_another_domain_is_cleared() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let session = SessionState {
		email: "u@untrusted.net".to_string(),
		..Default::default()
	};
	let value = session.encode(None).unwrap();
	let sealed = cookies::sign_value(COOKIE_SECRET, "_authgate", &value, SystemTime::now());
	let request = Request::builder()
		.method("GET")
		.uri("/app")
		.header("Host", "app.example.com")
		.header("Cookie", format!("_authgate={sealed}"))
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
	let cookies = set_cookies(&response);
	assert_eq!(cookie_value(&cookies, "_authgate"), Some(""));
}

#[tokio::test]
async fn tampered_session_cookie_is_treated_as_anonymous() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let mut sealed = session_cookie_header();
	sealed.push('x');
	let request = Request::builder()
		.method("GET")
		.uri("/app")
		.header("Host", "app.example.com")
		.header("Cookie", sealed)
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(request).await;
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn metrics_exposition_reports_handler_latencies() {
	let (proxy, _upstream) = proxy_with_upstream().await;
	let _ = proxy.serve(get("/ping")).await;
	let response = proxy.serve(get("/oauth2/metrics")).await;
	assert_eq!(response.status(), StatusCode::OK);
	let body = body_string(response).await;
	assert!(body.contains("http_request_duration_seconds"));
	assert!(body.contains("handler=\"ping\""));
}

#[tokio::test]
async fn skip_provider_button_forces_oauth_start() {
	let (proxy, _upstream) = {
		let upstream = MockServer::start().await;
		let mut config = test_config(&upstream.uri());
		config.skip_provider_button = true;
		(build_proxy(config), upstream)
	};
	let response = proxy.serve(get("/app")).await;
	assert_eq!(response.status(), StatusCode::FOUND);
	let location = response
		.headers()
		.get(http::header::LOCATION)
		.unwrap()
		.to_str()
		.unwrap();
	assert!(location.starts_with("https://idp.example.com/authorize?"));
	// The original request URI rides along as the post-login redirect.
	assert!(location.contains("%3A%2Fapp") || location.contains(":/app"));
}

#[tokio::test]
async fn full_sign_in_round_trip_via_start_and_callback() {
	let (proxy, upstream) = proxy_with_upstream().await;
	Mock::given(method("GET"))
		.and(path("/app"))
		.respond_with(ResponseTemplate::new(200).set_body_string("upstream ok"))
		.mount(&upstream)
		.await;

	let start = proxy.serve(get("/oauth2/start?rd=%2Fapp")).await;
	let start_cookies = set_cookies(&start);
	let nonce = cookie_value(&start_cookies, "_authgate_csrf").unwrap().to_string();

	let callback = Request::builder()
		.method("GET")
		.uri(format!("/oauth2/callback?code=good&state={nonce}:/app"))
		.header("Host", "app.example.com")
		.header("Cookie", format!("_authgate_csrf={nonce}"))
		.body(full(""))
		.unwrap();
	let callback_response = proxy.serve(callback).await;
	assert_eq!(callback_response.status(), StatusCode::FOUND);
	let callback_cookies = set_cookies(&callback_response);
	let session_value = cookie_value(&callback_cookies, "_authgate").unwrap().to_string();

	let authed = Request::builder()
		.method("GET")
		.uri("/app")
		.header("Host", "app.example.com")
		.header("Cookie", format!("_authgate={session_value}"))
		.body(authgate::empty())
		.unwrap();
	let response = proxy.serve(authed).await;
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_string(response).await, "upstream ok");
}
