use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use aws_lc_rs::constant_time::verify_slices_are_equal;
use aws_lc_rs::{hkdf, hmac, rand};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};

/// Tolerated forward drift between the clock that sealed a cookie and ours.
const CLOCK_SKEW: Duration = Duration::from_secs(5);

const FIELD_AAD: &[u8] = b"authgate_session_field";

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
	#[error("malformed sealed cookie")]
	Malformed,
	#[error("cookie signature mismatch")]
	BadSignature,
	#[error("cookie expired")]
	Expired,
	#[error("cookie timestamp is in the future")]
	FutureDated,
	#[error("decryption failed")]
	Crypto,
	#[error("random source failed")]
	Rand,
}

fn unix_seconds(t: SystemTime) -> u64 {
	t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn signature(secret: &str, parts: &[&str]) -> hmac::Tag {
	let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
	let mut ctx = hmac::Context::with_key(&key);
	for part in parts {
		ctx.update(part.as_bytes());
	}
	ctx.sign()
}

/// Seal `value` into `payload|timestamp|mac` where the MAC covers the cookie
/// name, the encoded payload, and the timestamp.
pub fn sign_value(secret: &str, name: &str, value: &str, now: SystemTime) -> String {
	let payload = URL_SAFE.encode(value.as_bytes());
	let timestamp = unix_seconds(now).to_string();
	let mac = signature(secret, &[name, &payload, &timestamp]);
	format!("{payload}|{timestamp}|{}", URL_SAFE.encode(mac.as_ref()))
}

/// Verify a sealed cookie value and return the embedded value and issue time.
/// Rejects bad MACs, values older than `max_age`, and values stamped further
/// than a small skew into the future.
pub fn validate_value(
	secret: &str,
	name: &str,
	sealed: &str,
	max_age: Duration,
) -> Result<(String, SystemTime), CookieError> {
	let mut parts = sealed.split('|');
	let (Some(payload), Some(timestamp), Some(mac), None) =
		(parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(CookieError::Malformed);
	};

	let provided = URL_SAFE
		.decode(mac.as_bytes())
		.map_err(|_| CookieError::Malformed)?;
	let expected = signature(secret, &[name, payload, timestamp]);
	verify_slices_are_equal(expected.as_ref(), &provided).map_err(|_| CookieError::BadSignature)?;

	let issued_secs: u64 = timestamp.parse().map_err(|_| CookieError::Malformed)?;
	let issued_at = UNIX_EPOCH + Duration::from_secs(issued_secs);
	let now = SystemTime::now();
	if issued_at > now + CLOCK_SKEW {
		return Err(CookieError::FutureDated);
	}
	if now.duration_since(issued_at).unwrap_or_default() > max_age {
		return Err(CookieError::Expired);
	}

	let value = URL_SAFE
		.decode(payload.as_bytes())
		.map_err(|_| CookieError::Malformed)?;
	let value = String::from_utf8(value).map_err(|_| CookieError::Malformed)?;
	Ok((value, issued_at))
}

/// 16 cryptographically-random bytes, base64-url encoded. Used for CSRF
/// nonces and sign-in form tokens.
pub fn nonce() -> Result<String, CookieError> {
	let mut bytes = [0u8; 16];
	rand::fill(&mut bytes).map_err(|_| CookieError::Rand)?;
	Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Encrypts individual session fields (access and refresh tokens) before they
/// are written into the cookie. The configured secret must be 16, 24 or 32
/// bytes; an AES-256-GCM key is derived from it with HKDF so all three
/// lengths seal identically.
pub struct CookieCipher {
	key: LessSafeKey,
}

impl std::fmt::Debug for CookieCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("CookieCipher")
	}
}

impl CookieCipher {
	pub fn new(secret: &[u8]) -> anyhow::Result<Self> {
		if !matches!(secret.len(), 16 | 24 | 32) {
			anyhow::bail!(
				"cookie-secret must be 16, 24 or 32 bytes to encrypt session tokens, got {}",
				secret.len()
			);
		}
		let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
		let prk = salt.extract(secret);
		let info: &[&[u8]] = &[b"authgate_cookie_cipher"];
		let okm = prk
			.expand(info, hkdf::HKDF_SHA256)
			.map_err(|_| anyhow::anyhow!("HKDF expansion failed"))?;
		let mut key_bytes = [0u8; 32];
		okm
			.fill(&mut key_bytes)
			.map_err(|_| anyhow::anyhow!("HKDF fill failed"))?;
		let unbound =
			UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| anyhow::anyhow!("invalid key"))?;
		Ok(Self {
			key: LessSafeKey::new(unbound),
		})
	}

	pub fn encrypt(&self, plaintext: &str) -> Result<String, CookieError> {
		let mut nonce_bytes = [0u8; 12];
		rand::fill(&mut nonce_bytes).map_err(|_| CookieError::Rand)?;
		let nonce = Nonce::assume_unique_for_key(nonce_bytes);

		let mut in_out = Vec::with_capacity(plaintext.len() + AES_256_GCM.tag_len());
		in_out.extend_from_slice(plaintext.as_bytes());
		self
			.key
			.seal_in_place_append_tag(nonce, Aad::from(FIELD_AAD), &mut in_out)
			.map_err(|_| CookieError::Crypto)?;

		// Prefix the nonce so decryption can reconstruct the AEAD input.
		let mut sealed = Vec::with_capacity(12 + in_out.len());
		sealed.extend_from_slice(&nonce_bytes);
		sealed.extend_from_slice(&in_out);
		Ok(STANDARD.encode(sealed))
	}

	pub fn decrypt(&self, value: &str) -> Result<String, CookieError> {
		let mut data = STANDARD
			.decode(value.as_bytes())
			.map_err(|_| CookieError::Crypto)?;
		if data.len() < 12 + AES_256_GCM.tag_len() {
			return Err(CookieError::Crypto);
		}
		let nonce =
			Nonce::try_assume_unique_for_key(&data[..12]).map_err(|_| CookieError::Crypto)?;
		let plaintext_len = {
			let in_out = &mut data[12..];
			let plaintext = self
				.key
				.open_in_place(nonce, Aad::from(FIELD_AAD), in_out)
				.map_err(|_| CookieError::Crypto)?;
			plaintext.len()
		};
		data.copy_within(12..12 + plaintext_len, 0);
		data.truncate(plaintext_len);
		String::from_utf8(data).map_err(|_| CookieError::Crypto)
	}
}

/// Constant-time string equality, used for the CSRF nonce comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
	verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}
