use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

pub const DEFAULT_COOKIE_NAME: &str = "_authgate";
pub const DEFAULT_PROXY_PREFIX: &str = "/oauth2";

/// Immutable proxy configuration, fully resolved before the proxy is built.
/// Flag and config-file plumbing lives in the app crate; validation of the
/// derived artifacts (regexes, signature key, cookie cipher) happens in
/// [`crate::proxy::OAuthProxy::new`].
#[derive(Debug)]
pub struct ProxyConfig {
	pub cookie_name: String,
	pub cookie_secret: SecretString,
	pub cookie_domain: Option<String>,
	pub cookie_secure: bool,
	pub cookie_http_only: bool,
	pub cookie_expire: Duration,
	/// Re-issue the session cookie once it is older than this. Zero disables.
	pub cookie_refresh: Duration,

	pub proxy_prefix: String,

	pub pass_basic_auth: bool,
	pub basic_auth_password: SecretString,
	pub pass_user_headers: bool,
	pub pass_access_token: bool,
	pub pass_host_header: bool,
	pub set_xauthrequest: bool,

	pub skip_auth_regex: Vec<String>,
	pub skip_auth_preflight: bool,
	pub skip_provider_button: bool,

	/// `algorithm:secret` pair for upstream request signing.
	pub signature_key: Option<String>,
	/// Absolute callback URL override. When unset the callback URL is derived
	/// from the request host.
	pub redirect_url: Option<Url>,
	/// Query/form field carrying the authorization code on the callback.
	pub callback_code_param: String,

	pub sign_in_message: String,
	pub display_htpasswd_form: bool,
	pub footer: String,
	pub custom_templates_dir: Option<PathBuf>,

	pub upstreams: Vec<Url>,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			cookie_name: DEFAULT_COOKIE_NAME.to_string(),
			cookie_secret: SecretString::from(String::new()),
			cookie_domain: None,
			cookie_secure: true,
			cookie_http_only: true,
			cookie_expire: Duration::from_secs(168 * 60 * 60),
			cookie_refresh: Duration::ZERO,
			proxy_prefix: DEFAULT_PROXY_PREFIX.to_string(),
			pass_basic_auth: true,
			basic_auth_password: SecretString::from(String::new()),
			pass_user_headers: true,
			pass_access_token: false,
			pass_host_header: true,
			set_xauthrequest: false,
			skip_auth_regex: vec![],
			skip_auth_preflight: false,
			skip_provider_button: false,
			signature_key: None,
			redirect_url: None,
			callback_code_param: "code".to_string(),
			sign_in_message: String::new(),
			display_htpasswd_form: true,
			footer: String::new(),
			custom_templates_dir: None,
			upstreams: vec![],
		}
	}
}

impl ProxyConfig {
	pub fn csrf_cookie_name(&self) -> String {
		format!("{}_csrf", self.cookie_name)
	}

	/// Raw key material from the configured cookie secret. A base64 value that
	/// decodes to a valid AES key length is accepted in decoded form, the way
	/// deployments commonly generate secrets.
	pub fn cookie_secret_bytes(&self) -> Vec<u8> {
		secret_bytes(self.cookie_secret.expose_secret())
	}
}

pub fn secret_bytes(secret: &str) -> Vec<u8> {
	if let Ok(decoded) = URL_SAFE.decode(secret.as_bytes())
		&& matches!(decoded.len(), 16 | 24 | 32)
	{
		return decoded;
	}
	secret.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_bytes_prefers_decoded_form_for_valid_lengths() {
		let raw = [7u8; 32];
		let encoded = URL_SAFE.encode(raw);
		assert_eq!(secret_bytes(&encoded), raw.to_vec());
	}

	#[test]
	fn secret_bytes_falls_back_to_raw() {
		assert_eq!(secret_bytes("0123456789abcdef"), b"0123456789abcdef");
	}

	#[test]
	fn csrf_cookie_name_derives_from_session_cookie() {
		let config = ProxyConfig::default();
		assert_eq!(config.csrf_cookie_name(), "_authgate_csrf");
	}
}
