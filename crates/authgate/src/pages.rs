use std::path::Path;

use handlebars::Handlebars;
use serde_json::json;
use tracing::error;

const SIGN_IN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en" charset="utf-8">
<head>
	<title>Sign In</title>
	<meta name="viewport" content="width=device-width, initial-scale=1">
	<style>
	body {
		font-family: "Helvetica Neue", Helvetica, Arial, sans-serif;
		font-size: 18px;
		text-align: center;
		background-color: #f0f0f0;
	}
	.signin {
		display: inline-block;
		background-color: #fff;
		border-radius: 4px;
		margin-top: 80px;
		padding: 20px 40px;
	}
	button {
		font-size: 18px;
		padding: 10px 20px;
		cursor: pointer;
	}
	footer {
		margin-top: 40px;
		font-size: 12px;
		color: #999;
	}
	</style>
</head>
<body>
	<div class="signin">
	{{#if sign_in_message}}<p>{{sign_in_message}}</p>{{/if}}
	<form method="GET" action="{{proxy_prefix}}/start">
		<input type="hidden" name="rd" value="{{redirect}}">
		<button type="submit">Sign in with {{provider_name}}</button>
	</form>
	{{#if custom_login}}
	<hr>
	<form method="POST" action="{{proxy_prefix}}/sign_in">
		<input type="hidden" name="rd" value="{{redirect}}">
		<input type="hidden" name="csrf_token" value="{{csrf_token}}">
		<label for="username">Username:</label>
		<input type="text" name="username" id="username"><br>
		<label for="password">Password:</label>
		<input type="password" name="password" id="password"><br>
		<button type="submit">Sign In</button>
	</form>
	{{/if}}
	</div>
	<footer>
	{{#if footer}}{{footer}}{{else}}Secured with authgate v{{version}}{{/if}}
	</footer>
</body>
</html>
"#;

const ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en" charset="utf-8">
<head>
	<title>{{title}}</title>
	<meta name="viewport" content="width=device-width, initial-scale=1">
</head>
<body>
	<h2>{{title}}</h2>
	<p>{{message}}</p>
	<hr>
	<p><a href="{{proxy_prefix}}/sign_in">Sign In</a></p>
</body>
</html>
"#;

/// Renders the built-in sign-in and error pages, with per-file overrides from
/// a custom templates directory.
pub struct Pages {
	templates: Handlebars<'static>,
}

impl std::fmt::Debug for Pages {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("Pages")
	}
}

pub struct SignInData<'a> {
	pub provider_name: &'a str,
	pub sign_in_message: &'a str,
	pub custom_login: bool,
	pub redirect: &'a str,
	pub csrf_token: &'a str,
	pub proxy_prefix: &'a str,
	pub footer: &'a str,
	pub version: &'a str,
}

impl Pages {
	pub fn load(custom_dir: Option<&Path>) -> anyhow::Result<Self> {
		let mut templates = Handlebars::new();
		templates.register_template_string("sign_in.html", SIGN_IN_TEMPLATE)?;
		templates.register_template_string("error.html", ERROR_TEMPLATE)?;
		if let Some(dir) = custom_dir {
			for name in ["sign_in.html", "error.html"] {
				let path = dir.join(name);
				if path.is_file() {
					templates.register_template_file(name, &path)?;
				}
			}
		}
		Ok(Self { templates })
	}

	pub fn sign_in(&self, data: &SignInData<'_>) -> String {
		let context = json!({
			"provider_name": data.provider_name,
			"sign_in_message": data.sign_in_message,
			"custom_login": data.custom_login,
			"redirect": data.redirect,
			"csrf_token": data.csrf_token,
			"proxy_prefix": data.proxy_prefix,
			"footer": data.footer,
			"version": data.version,
		});
		self.render("sign_in.html", &context)
	}

	pub fn error(&self, code: http::StatusCode, title: &str, message: &str, proxy_prefix: &str) -> String {
		let context = json!({
			"title": format!("{} {}", code.as_u16(), title),
			"message": message,
			"proxy_prefix": proxy_prefix,
		});
		self.render("error.html", &context)
	}

	fn render(&self, name: &str, context: &serde_json::Value) -> String {
		match self.templates.render(name, context) {
			Ok(html) => html,
			Err(err) => {
				error!(template = name, error = %err, "template render failed");
				"Internal Error".to_string()
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pages() -> Pages {
		Pages::load(None).unwrap()
	}

	#[test]
	fn sign_in_page_renders_provider_and_redirect() {
		let html = pages().sign_in(&SignInData {
			provider_name: "Google",
			sign_in_message: "Authenticate using example.com",
			custom_login: false,
			redirect: "/app",
			csrf_token: "",
			proxy_prefix: "/oauth2",
			footer: "",
			version: "0.3.0",
		});
		assert!(html.contains("Sign in with Google"));
		assert!(html.contains("Authenticate using example.com"));
		assert!(html.contains(r#"value="/app""#));
		assert!(html.contains("/oauth2/start"));
		assert!(!html.contains("password"));
	}

	#[test]
	fn sign_in_page_shows_login_form_with_csrf_token() {
		let html = pages().sign_in(&SignInData {
			provider_name: "Google",
			sign_in_message: "",
			custom_login: true,
			redirect: "/",
			csrf_token: "tok-123",
			proxy_prefix: "/oauth2",
			footer: "",
			version: "0.3.0",
		});
		assert!(html.contains(r#"name="username""#));
		assert!(html.contains(r#"name="password""#));
		assert!(html.contains(r#"name="csrf_token" value="tok-123""#));
	}

	#[test]
	fn error_page_renders_code_and_message() {
		let html = pages().error(
			http::StatusCode::FORBIDDEN,
			"Permission Denied",
			"Invalid Account",
			"/oauth2",
		);
		assert!(html.contains("403 Permission Denied"));
		assert!(html.contains("Invalid Account"));
		assert!(html.contains("/oauth2/sign_in"));
	}

	#[test]
	fn html_in_data_is_escaped() {
		let html = pages().error(
			http::StatusCode::FORBIDDEN,
			"Permission Denied",
			"<script>alert(1)</script>",
			"/oauth2",
		);
		assert!(!html.contains("<script>"));
	}
}
