#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use roomcast_domain::{Identity, UserId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::server::store::Store;

/// Claims carried inside a `v1.<payload>.<sig>` access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Subject user id.
	pub sub: i64,
	/// Expiry, unix seconds.
	pub exp: u64,
}

/// Mint a stateless HMAC-SHA256 access token for a user.
pub fn issue_token(user: UserId, secret: &str, ttl: Duration) -> String {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	let claims = AuthClaims {
		sub: user.as_i64(),
		exp: now.saturating_add(ttl.as_secs()),
	};

	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);

	format!("v1.{payload_b64}.{sig_b64}")
}

/// Verify a token's format, signature, and expiry.
pub fn verify_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Resolve an optional bearer token to an identity. Never fails: a missing,
/// malformed, expired, or badly-signed token, and a subject that no longer
/// exists, all resolve to the anonymous identity. Callers check for
/// anonymity before granting access.
pub async fn resolve_identity(store: &Store, raw_token: Option<&str>, secret: &str) -> Identity {
	let Some(token) = raw_token.map(str::trim).filter(|t| !t.is_empty()) else {
		return Identity::Anonymous;
	};

	let claims = match verify_token(token, secret) {
		Ok(claims) => claims,
		Err(e) => {
			debug!(error = %e, "token rejected, resolving as anonymous");
			return Identity::Anonymous;
		}
	};

	match store.get_user(UserId::new(claims.sub)).await {
		Ok(profile) => Identity::User(profile),
		Err(e) => {
			debug!(sub = claims.sub, error = %e, "token subject not found, resolving as anonymous");
			Identity::Anonymous
		}
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &str = "unit-test-secret";

	#[test]
	fn issued_tokens_verify() {
		let token = issue_token(UserId::new(42), SECRET, Duration::from_secs(60));
		let claims = verify_token(&token, SECRET).expect("verify");
		assert_eq!(claims.sub, 42);
	}

	#[test]
	fn expired_tokens_are_rejected() {
		let token = issue_token(UserId::new(1), SECRET, Duration::ZERO);
		let err = verify_token(&token, SECRET).unwrap_err();
		assert!(err.to_string().contains("expired"));
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let token = issue_token(UserId::new(1), SECRET, Duration::from_secs(60));
		assert!(verify_token(&token, "other-secret").is_err());
	}

	#[test]
	fn tampered_payload_is_rejected() {
		let token = issue_token(UserId::new(1), SECRET, Duration::from_secs(60));
		let mut parts = token.split('.').map(str::to_string).collect::<Vec<_>>();
		parts[1] = URL_SAFE_NO_PAD.encode(r#"{"sub":999,"exp":99999999999}"#);
		assert!(verify_token(&parts.join("."), SECRET).is_err());
	}

	#[test]
	fn garbage_tokens_are_rejected() {
		assert!(verify_token("", SECRET).is_err());
		assert!(verify_token("v1.alone", SECRET).is_err());
		assert!(verify_token("v2.a.b", SECRET).is_err());
		assert!(verify_token("not a token at all", SECRET).is_err());
	}

	#[tokio::test]
	async fn resolve_falls_back_to_anonymous() {
		let store = Store::connect("sqlite::memory:", 500).await.expect("store");

		assert!(resolve_identity(&store, None, SECRET).await.is_anonymous());
		assert!(resolve_identity(&store, Some(""), SECRET).await.is_anonymous());
		assert!(resolve_identity(&store, Some("garbage"), SECRET).await.is_anonymous());

		// A valid token whose subject does not exist resolves anonymous.
		let token = issue_token(UserId::new(999), SECRET, Duration::from_secs(60));
		assert!(resolve_identity(&store, Some(&token), SECRET).await.is_anonymous());

		let profile = store.create_user("a@example.com", "a", "hash").await.expect("user");
		let token = issue_token(profile.id, SECRET, Duration::from_secs(60));
		let identity = resolve_identity(&store, Some(&token), SECRET).await;
		assert_eq!(identity.user_id(), Some(profile.id));
	}
}
