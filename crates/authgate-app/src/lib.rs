mod options;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use authgate::htpasswd::Htpasswd;
use authgate::proxy::OAuthProxy;

pub(crate) use options::{FileConfig, resolve_options};

#[derive(Parser, Debug, Default)]
#[command(name = "authgate", about = "Authenticating reverse proxy", version)]
pub struct Cli {
	/// Path to a YAML config file; explicit flags take precedence
	#[arg(long, value_name = "file")]
	pub config: Option<PathBuf>,

	/// <addr>:<port> to listen on for HTTP clients
	#[arg(long, value_name = "address")]
	pub http_address: Option<String>,

	/// The OAuth redirect URL, e.g. "https://app.example.com/oauth2/callback"
	#[arg(long)]
	pub redirect_url: Option<String>,

	/// HTTP or file upstream for request routing by path (repeatable)
	#[arg(long = "upstream")]
	pub upstreams: Vec<String>,

	/// Authenticate emails with the given domain; use * for any (repeatable)
	#[arg(long = "email-domain")]
	pub email_domains: Vec<String>,

	/// Authenticate against emails listed in this file, one per line
	#[arg(long, value_name = "file")]
	pub authenticated_emails_file: Option<PathBuf>,

	/// Additionally authenticate against an htpasswd file ("htpasswd -s" entries)
	#[arg(long, value_name = "file")]
	pub htpasswd_file: Option<PathBuf>,

	/// Display the username/password form when an htpasswd file is provided
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub display_htpasswd_form: Option<bool>,

	/// Path to custom HTML templates
	#[arg(long, value_name = "dir")]
	pub custom_templates_dir: Option<PathBuf>,

	/// Custom footer string
	#[arg(long)]
	pub footer: Option<String>,

	/// URL root path the proxy is nested under
	#[arg(long)]
	pub proxy_prefix: Option<String>,

	#[arg(long)]
	pub cookie_name: Option<String>,
	/// Seed string for secure cookies, optionally base64 encoded
	#[arg(long)]
	pub cookie_secret: Option<String>,
	#[arg(long)]
	pub cookie_domain: Option<String>,
	/// Cookie lifetime, e.g. "168h" or "3600s"
	#[arg(long, value_name = "duration")]
	pub cookie_expire: Option<String>,
	/// Refresh the cookie after this duration; "0" to disable
	#[arg(long, value_name = "duration")]
	pub cookie_refresh: Option<String>,
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub cookie_secure: Option<bool>,
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub cookie_httponly: Option<bool>,

	/// Pass HTTP Basic Auth, X-Forwarded-User and X-Forwarded-Email upstream
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub pass_basic_auth: Option<bool>,
	/// Password set in the HTTP Basic Auth header
	#[arg(long)]
	pub basic_auth_password: Option<String>,
	/// Pass X-Forwarded-User and X-Forwarded-Email upstream
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub pass_user_headers: Option<bool>,
	/// Pass the OAuth access token upstream via X-Forwarded-Access-Token
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub pass_access_token: Option<bool>,
	/// Pass the request Host header upstream
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub pass_host_header: Option<bool>,
	/// Set X-Auth-Request-User and X-Auth-Request-Email response headers
	#[arg(long = "set-xauthrequest", action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub set_xauthrequest: Option<bool>,

	/// Bypass authentication for request paths matching this regex (repeatable)
	#[arg(long = "skip-auth-regex")]
	pub skip_auth_regex: Vec<String>,
	/// Skip authentication for OPTIONS requests
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub skip_auth_preflight: Option<bool>,
	/// Skip the sign-in page and go straight to the provider
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub skip_provider_button: Option<bool>,

	/// GAP-Signature request signature key ("algorithm:secretkey")
	#[arg(long)]
	pub signature_key: Option<String>,

	/// Log requests to stdout
	#[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
	pub request_logging: Option<bool>,

	/// OAuth provider display name
	#[arg(long)]
	pub provider: Option<String>,
	/// Authorization endpoint
	#[arg(long)]
	pub login_url: Option<String>,
	/// Token redemption endpoint
	#[arg(long)]
	pub redeem_url: Option<String>,
	/// Profile access endpoint
	#[arg(long)]
	pub profile_url: Option<String>,
	/// Access token validation endpoint
	#[arg(long)]
	pub validate_url: Option<String>,
	/// OAuth scope specification
	#[arg(long)]
	pub scope: Option<String>,
	/// OAuth approval_prompt
	#[arg(long)]
	pub approval_prompt: Option<String>,
	/// OAuth Client ID
	#[arg(long)]
	pub client_id: Option<String>,
	/// OAuth Client Secret
	#[arg(long)]
	pub client_secret: Option<String>,
	/// URL for retrieving the JWT signing keys; switches bearer-token
	/// verification to the key set
	#[arg(long)]
	pub jwt_keys_url: Option<String>,

	/// Form field carrying the authorization code on the OAuth callback
	#[arg(long)]
	pub callback_code_param: Option<String>,
}

pub fn run() -> anyhow::Result<()> {
	let cli = Cli::parse();
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let file = match &cli.config {
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.map_err(|e| anyhow::anyhow!("failed to load config file {}: {e}", path.display()))?;
			serde_yaml::from_str::<FileConfig>(&contents)
				.map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?
		},
		None => FileConfig::default(),
	};

	let resolved = resolve_options(&cli, file)?;

	let validator = authgate::validator::new(
		resolved.email_domains.clone(),
		resolved.authenticated_emails_file.as_deref(),
	)?;

	let htpasswd = match &resolved.htpasswd_file {
		Some(path) => {
			info!(file = %path.display(), "using htpasswd file");
			Some(Arc::new(Htpasswd::from_file(path)?))
		},
		None => None,
	};

	let proxy = Arc::new(OAuthProxy::new(
		resolved.proxy,
		resolved.provider,
		validator,
		htpasswd,
	)?);

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;
	runtime.block_on(server::serve(
		proxy,
		resolved.http_address,
		resolved.request_logging,
	))
}
