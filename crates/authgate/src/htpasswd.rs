use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use aws_lc_rs::digest;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

/// Credential store backed by an `htpasswd -s` file ({SHA} entries). Reads go
/// through a snapshot behind a lightweight lock so an external watcher can
/// hot-swap the contents with [`Htpasswd::reload`].
#[derive(Debug, Default)]
pub struct Htpasswd {
	users: RwLock<HashMap<String, String>>,
}

impl Htpasswd {
	pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let contents = std::fs::read_to_string(path.as_ref())?;
		Ok(Self {
			users: RwLock::new(parse(&contents)?),
		})
	}

	pub fn from_contents(contents: &str) -> anyhow::Result<Self> {
		Ok(Self {
			users: RwLock::new(parse(contents)?),
		})
	}

	/// Replace the snapshot wholesale. Used by file watchers.
	pub fn reload(&self, contents: &str) -> anyhow::Result<()> {
		let users = parse(contents)?;
		*self.users.write().expect("htpasswd lock") = users;
		Ok(())
	}

	pub fn validate(&self, user: &str, password: &str) -> bool {
		let users = self.users.read().expect("htpasswd lock");
		let Some(hash) = users.get(user) else {
			return false;
		};
		let Some(expected) = hash.strip_prefix("{SHA}") else {
			warn!(user, "htpasswd entry is not SHA encrypted, use \"htpasswd -s\"");
			return false;
		};
		let sum = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes());
		STANDARD.encode(sum.as_ref()) == expected
	}
}

fn parse(contents: &str) -> anyhow::Result<HashMap<String, String>> {
	let mut users = HashMap::new();
	for (lineno, line) in contents.lines().enumerate() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let Some((user, hash)) = line.split_once(':') else {
			anyhow::bail!("invalid htpasswd entry on line {}", lineno + 1);
		};
		users.insert(user.to_string(), hash.to_string());
	}
	Ok(users)
}
