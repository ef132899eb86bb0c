use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use authgate::config::ProxyConfig;
use authgate::providers::{GenericProvider, KeysetProvider, Provider, ProviderData};

use crate::Cli;

/// Config-file counterpart of the CLI surface. Explicit flags win over file
/// values, file values win over built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
	pub http_address: Option<String>,
	pub redirect_url: Option<String>,
	#[serde(default)]
	pub upstreams: Vec<String>,
	#[serde(default)]
	pub email_domains: Vec<String>,
	pub authenticated_emails_file: Option<PathBuf>,
	pub htpasswd_file: Option<PathBuf>,
	pub display_htpasswd_form: Option<bool>,
	pub custom_templates_dir: Option<PathBuf>,
	pub footer: Option<String>,
	pub proxy_prefix: Option<String>,
	pub cookie_name: Option<String>,
	pub cookie_secret: Option<String>,
	pub cookie_domain: Option<String>,
	pub cookie_expire: Option<String>,
	pub cookie_refresh: Option<String>,
	pub cookie_secure: Option<bool>,
	pub cookie_httponly: Option<bool>,
	pub pass_basic_auth: Option<bool>,
	pub basic_auth_password: Option<String>,
	pub pass_user_headers: Option<bool>,
	pub pass_access_token: Option<bool>,
	pub pass_host_header: Option<bool>,
	pub set_xauthrequest: Option<bool>,
	#[serde(default)]
	pub skip_auth_regex: Vec<String>,
	pub skip_auth_preflight: Option<bool>,
	pub skip_provider_button: Option<bool>,
	pub signature_key: Option<String>,
	pub request_logging: Option<bool>,
	pub provider: Option<String>,
	pub login_url: Option<String>,
	pub redeem_url: Option<String>,
	pub profile_url: Option<String>,
	pub validate_url: Option<String>,
	pub scope: Option<String>,
	pub approval_prompt: Option<String>,
	pub client_id: Option<String>,
	pub client_secret: Option<String>,
	pub jwt_keys_url: Option<String>,
	pub callback_code_param: Option<String>,
}

pub struct ResolvedOptions {
	pub proxy: ProxyConfig,
	pub provider: Arc<dyn Provider>,
	pub email_domains: Vec<String>,
	pub authenticated_emails_file: Option<PathBuf>,
	pub htpasswd_file: Option<PathBuf>,
	pub http_address: String,
	pub request_logging: bool,
}

/// Accepts plain seconds or a value with an s/m/h/d suffix, e.g. "168h".
fn parse_duration(value: &str) -> anyhow::Result<Duration> {
	let value = value.trim();
	if let Ok(secs) = value.parse::<u64>() {
		return Ok(Duration::from_secs(secs));
	}
	let (number, unit) = value.split_at(value.len().saturating_sub(1));
	let number: u64 = number
		.parse()
		.map_err(|_| anyhow::anyhow!("invalid duration {value:?}"))?;
	let seconds = match unit {
		"s" => number,
		"m" => number * 60,
		"h" => number * 60 * 60,
		"d" => number * 24 * 60 * 60,
		_ => anyhow::bail!("invalid duration {value:?}, expected s/m/h/d suffix"),
	};
	Ok(Duration::from_secs(seconds))
}

fn parse_url(value: &str, flag: &str) -> anyhow::Result<Url> {
	value
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid {flag} {value:?}: {e}"))
}

pub fn resolve_options(cli: &Cli, file: FileConfig) -> anyhow::Result<ResolvedOptions> {
	let defaults = ProxyConfig::default();

	let pick = |cli_value: &Option<String>, file_value: Option<String>| {
		cli_value.clone().or(file_value)
	};
	let pick_bool = |cli_value: Option<bool>, file_value: Option<bool>, default: bool| {
		cli_value.or(file_value).unwrap_or(default)
	};

	let cookie_secret = pick(&cli.cookie_secret, file.cookie_secret)
		.ok_or_else(|| anyhow::anyhow!("missing setting: cookie-secret"))?;
	let client_id = pick(&cli.client_id, file.client_id)
		.ok_or_else(|| anyhow::anyhow!("missing setting: client-id"))?;
	let client_secret = pick(&cli.client_secret, file.client_secret)
		.ok_or_else(|| anyhow::anyhow!("missing setting: client-secret"))?;

	let upstream_strings = if cli.upstreams.is_empty() {
		file.upstreams
	} else {
		cli.upstreams.clone()
	};
	if upstream_strings.is_empty() {
		anyhow::bail!("missing setting: upstream");
	}
	let upstreams = upstream_strings
		.iter()
		.map(|u| parse_url(u, "upstream"))
		.collect::<anyhow::Result<Vec<_>>>()?;

	let email_domains = if cli.email_domains.is_empty() {
		file.email_domains
	} else {
		cli.email_domains.clone()
	};

	let login_url = pick(&cli.login_url, file.login_url)
		.ok_or_else(|| anyhow::anyhow!("missing setting: login-url"))?;
	let redeem_url = pick(&cli.redeem_url, file.redeem_url)
		.ok_or_else(|| anyhow::anyhow!("missing setting: redeem-url"))?;

	let provider_data = ProviderData {
		provider_name: pick(&cli.provider, file.provider).unwrap_or_else(|| "OAuth".to_string()),
		login_url: parse_url(&login_url, "login-url")?,
		redeem_url: parse_url(&redeem_url, "redeem-url")?,
		profile_url: pick(&cli.profile_url, file.profile_url)
			.map(|u| parse_url(&u, "profile-url"))
			.transpose()?,
		validate_url: pick(&cli.validate_url, file.validate_url)
			.map(|u| parse_url(&u, "validate-url"))
			.transpose()?,
		scope: pick(&cli.scope, file.scope).unwrap_or_default(),
		client_id,
		client_secret: SecretString::from(client_secret),
		approval_prompt: pick(&cli.approval_prompt, file.approval_prompt)
			.unwrap_or_else(|| "force".to_string()),
	};
	let provider: Arc<dyn Provider> = match pick(&cli.jwt_keys_url, file.jwt_keys_url) {
		Some(keys_url) => Arc::new(KeysetProvider::new(
			provider_data,
			parse_url(&keys_url, "jwt-keys-url")?,
		)),
		None => Arc::new(GenericProvider::new(provider_data)),
	};

	let mut sign_in_message = String::new();
	if !email_domains.is_empty()
		&& cli.authenticated_emails_file.is_none()
		&& file.authenticated_emails_file.is_none()
	{
		if email_domains.len() > 1 {
			sign_in_message = format!(
				"Authenticate using one of the following domains: {}",
				email_domains.join(", ")
			);
		} else if email_domains[0] != "*" {
			sign_in_message = format!("Authenticate using {}", email_domains[0]);
		}
	}

	let cookie_expire = match pick(&cli.cookie_expire, file.cookie_expire) {
		Some(value) => parse_duration(&value)?,
		None => defaults.cookie_expire,
	};
	let cookie_refresh = match pick(&cli.cookie_refresh, file.cookie_refresh) {
		Some(value) => parse_duration(&value)?,
		None => Duration::ZERO,
	};

	let proxy = ProxyConfig {
		cookie_name: pick(&cli.cookie_name, file.cookie_name).unwrap_or(defaults.cookie_name),
		cookie_secret: SecretString::from(cookie_secret),
		cookie_domain: pick(&cli.cookie_domain, file.cookie_domain),
		cookie_secure: pick_bool(cli.cookie_secure, file.cookie_secure, defaults.cookie_secure),
		cookie_http_only: pick_bool(
			cli.cookie_httponly,
			file.cookie_httponly,
			defaults.cookie_http_only,
		),
		cookie_expire,
		cookie_refresh,
		proxy_prefix: pick(&cli.proxy_prefix, file.proxy_prefix).unwrap_or(defaults.proxy_prefix),
		pass_basic_auth: pick_bool(
			cli.pass_basic_auth,
			file.pass_basic_auth,
			defaults.pass_basic_auth,
		),
		basic_auth_password: SecretString::from(
			pick(&cli.basic_auth_password, file.basic_auth_password).unwrap_or_default(),
		),
		pass_user_headers: pick_bool(
			cli.pass_user_headers,
			file.pass_user_headers,
			defaults.pass_user_headers,
		),
		pass_access_token: pick_bool(
			cli.pass_access_token,
			file.pass_access_token,
			defaults.pass_access_token,
		),
		pass_host_header: pick_bool(
			cli.pass_host_header,
			file.pass_host_header,
			defaults.pass_host_header,
		),
		set_xauthrequest: pick_bool(
			cli.set_xauthrequest,
			file.set_xauthrequest,
			defaults.set_xauthrequest,
		),
		skip_auth_regex: if cli.skip_auth_regex.is_empty() {
			file.skip_auth_regex
		} else {
			cli.skip_auth_regex.clone()
		},
		skip_auth_preflight: pick_bool(cli.skip_auth_preflight, file.skip_auth_preflight, false),
		skip_provider_button: pick_bool(cli.skip_provider_button, file.skip_provider_button, false),
		signature_key: pick(&cli.signature_key, file.signature_key),
		redirect_url: pick(&cli.redirect_url, file.redirect_url)
			.map(|u| parse_url(&u, "redirect-url"))
			.transpose()?,
		callback_code_param: pick(&cli.callback_code_param, file.callback_code_param)
			.unwrap_or(defaults.callback_code_param),
		sign_in_message,
		display_htpasswd_form: pick_bool(
			cli.display_htpasswd_form,
			file.display_htpasswd_form,
			defaults.display_htpasswd_form,
		),
		footer: pick(&cli.footer, file.footer).unwrap_or_default(),
		custom_templates_dir: cli
			.custom_templates_dir
			.clone()
			.or(file.custom_templates_dir),
		upstreams,
	};

	Ok(ResolvedOptions {
		proxy,
		provider,
		email_domains,
		authenticated_emails_file: cli
			.authenticated_emails_file
			.clone()
			.or(file.authenticated_emails_file),
		htpasswd_file: cli.htpasswd_file.clone().or(file.htpasswd_file),
		http_address: pick(&cli.http_address, file.http_address)
			.unwrap_or_else(|| "127.0.0.1:4180".to_string()),
		request_logging: pick_bool(cli.request_logging, file.request_logging, true),
	})
}
