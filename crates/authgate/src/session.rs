use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cookies::CookieCipher;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("invalid session: {0}")]
	Invalid(&'static str),
	#[error("session field decryption failed")]
	Crypto,
}

/// The authenticated principal for one browser. Request-scoped unless
/// serialized into the session cookie.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
	pub user: String,
	pub email: String,
	pub access_token: String,
	pub refresh_token: String,
	pub expires_on: Option<SystemTime>,
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Session{{email:{} user:{}", self.email, self.user)?;
		if !self.access_token.is_empty() {
			write!(f, " token:true")?;
		}
		if let Some(expires) = self.expires_on {
			write!(f, " expires:{}", unix_seconds(expires))?;
		}
		if !self.refresh_token.is_empty() {
			write!(f, " refresh_token:true")?;
		}
		write!(f, "}}")
	}
}

fn unix_seconds(t: SystemTime) -> u64 {
	t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl SessionState {
	pub fn is_expired(&self) -> bool {
		match self.expires_on {
			Some(expires) => expires < SystemTime::now(),
			None => false,
		}
	}

	/// `email` is authoritative for authorization; `user` is the fallback
	/// identity for display and the `GAP-Auth` header.
	pub fn principal(&self) -> &str {
		if self.email.is_empty() {
			&self.user
		} else {
			&self.email
		}
	}

	fn account_info(&self) -> String {
		if self.user.is_empty() {
			self.email.clone()
		} else {
			format!("{} {}", self.email, self.user)
		}
	}

	/// Serialize for the session cookie. Without a cipher the tokens are not
	/// persisted and only the account form is emitted; with one, the token
	/// fields are individually encrypted.
	pub fn encode(&self, cipher: Option<&CookieCipher>) -> Result<String, SessionError> {
		let Some(cipher) = cipher else {
			return Ok(self.account_info());
		};
		if self.access_token.is_empty() && self.refresh_token.is_empty() {
			return Ok(self.account_info());
		}
		let access = encrypt_field(cipher, &self.access_token)?;
		let refresh = encrypt_field(cipher, &self.refresh_token)?;
		let expires = match self.expires_on {
			Some(t) => unix_seconds(t).to_string(),
			None => String::new(),
		};
		Ok(format!("{}|{access}|{expires}|{refresh}", self.account_info()))
	}

	/// Field-by-field inverse of [`encode`](Self::encode). Missing fields
	/// yield empty strings; an unparsable `expires_on` is an invalid session.
	pub fn decode(value: &str, cipher: Option<&CookieCipher>) -> Result<Self, SessionError> {
		let chunks: Vec<&str> = value.split('|').collect();
		let mut session = match chunks.first() {
			Some(account) => from_account_info(account),
			None => return Err(SessionError::Invalid("empty cookie")),
		};
		match chunks.len() {
			1 => Ok(session),
			4 => {
				session.access_token = decrypt_field(cipher, chunks[1])?;
				session.refresh_token = decrypt_field(cipher, chunks[3])?;
				if !chunks[2].is_empty() {
					let secs: u64 = chunks[2]
						.parse()
						.map_err(|_| SessionError::Invalid("bad expiry timestamp"))?;
					session.expires_on = Some(UNIX_EPOCH + Duration::from_secs(secs));
				}
				Ok(session)
			},
			_ => Err(SessionError::Invalid("wrong field count")),
		}
	}
}

fn from_account_info(account: &str) -> SessionState {
	let (email, user) = match account.split_once(' ') {
		Some((email, user)) => (email.to_string(), user.to_string()),
		None => (account.to_string(), String::new()),
	};
	SessionState {
		user,
		email,
		..Default::default()
	}
}

fn encrypt_field(cipher: &CookieCipher, value: &str) -> Result<String, SessionError> {
	if value.is_empty() {
		return Ok(String::new());
	}
	cipher.encrypt(value).map_err(|_| SessionError::Crypto)
}

fn decrypt_field(cipher: Option<&CookieCipher>, value: &str) -> Result<String, SessionError> {
	if value.is_empty() {
		return Ok(String::new());
	}
	let Some(cipher) = cipher else {
		return Err(SessionError::Invalid("token fields without a cipher"));
	};
	cipher.decrypt(value).map_err(|_| SessionError::Crypto)
}
