use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Email authorization predicate: accepts an email when it matches one of the
/// configured domains (`*` accepts everything) or appears in the
/// authenticated-emails file.
pub type Validator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn new(email_domains: Vec<String>, emails_file: Option<&Path>) -> anyhow::Result<Validator> {
	let emails = match emails_file {
		Some(path) => load_emails(path)?,
		None => HashSet::new(),
	};
	Ok(from_parts(email_domains, emails))
}

fn load_emails(path: &Path) -> anyhow::Result<HashSet<String>> {
	let contents = std::fs::read_to_string(path)?;
	Ok(
		contents
			.lines()
			.map(str::trim)
			.filter(|line| !line.is_empty() && !line.starts_with('#'))
			.map(str::to_lowercase)
			.collect(),
	)
}

fn from_parts(email_domains: Vec<String>, emails: HashSet<String>) -> Validator {
	let allow_all = email_domains.iter().any(|d| d == "*");
	// Normalize to `@domain` suffixes so `example.com` cannot match
	// `notexample.com`.
	let suffixes: Vec<String> = email_domains
		.iter()
		.filter(|d| *d != "*")
		.map(|d| format!("@{}", d.trim_start_matches('@').to_lowercase()))
		.collect();

	Arc::new(move |email: &str| {
		if email.is_empty() {
			return false;
		}
		if allow_all {
			return true;
		}
		let email = email.to_lowercase();
		suffixes.iter().any(|suffix| email.ends_with(suffix)) || emails.contains(&email)
	})
}
