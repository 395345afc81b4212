//! Shared-proxy-key verification. If a proxy key is
//! configured, every request must present it: OpenAI-dialect callers via
//! `Authorization: Bearer <key>`, Anthropic-dialect callers via
//! `x-api-key: <key>`. A missing or mismatched key is a 401, never retried.

use agent_core::prelude::*;

use crate::error::Error;
use crate::types::request::ClientProtocol;

/// Constant-time-ish comparison so a timing side-channel can't narrow down
/// the configured key one byte at a time.
fn secure_eq(a: &str, b: &str) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn presented_key(protocol: ClientProtocol, headers: &http::HeaderMap) -> Option<&str> {
	match protocol {
		ClientProtocol::OpenAI => headers
			.get(http::header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer ")),
		ClientProtocol::Anthropic => headers.get("x-api-key").and_then(|v| v.to_str().ok()),
	}
}

/// Verify the caller's credential against the configured proxy key. `None`
/// for `proxy_key` means auth is not enforced.
pub fn verify(proxy_key: Option<&Strng>, protocol: ClientProtocol, headers: &http::HeaderMap) -> Result<(), Error> {
	let Some(expected) = proxy_key else {
		return Ok(());
	};
	match presented_key(protocol, headers) {
		Some(presented) if secure_eq(presented, expected.as_str()) => Ok(()),
		_ => Err(Error::unauthorized(strng::literal("missing or invalid proxy key"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers_with(name: &str, value: &str) -> http::HeaderMap {
		let mut h = http::HeaderMap::new();
		h.insert(http::HeaderName::from_bytes(name.as_bytes()).unwrap(), value.parse().unwrap());
		h
	}

	#[test]
	fn no_proxy_key_configured_always_passes() {
		let headers = http::HeaderMap::new();
		assert!(verify(None, ClientProtocol::OpenAI, &headers).is_ok());
	}

	#[test]
	fn openai_dialect_checks_bearer() {
		let key = strng::literal("secret");
		let headers = headers_with("authorization", "Bearer secret");
		assert!(verify(Some(&key), ClientProtocol::OpenAI, &headers).is_ok());

		let wrong = headers_with("authorization", "Bearer wrong");
		assert!(verify(Some(&key), ClientProtocol::OpenAI, &wrong).is_err());
	}

	#[test]
	fn anthropic_dialect_checks_x_api_key() {
		let key = strng::literal("secret");
		let headers = headers_with("x-api-key", "secret");
		assert!(verify(Some(&key), ClientProtocol::Anthropic, &headers).is_ok());
	}

	#[test]
	fn missing_credential_is_unauthorized() {
		let key = strng::literal("secret");
		let headers = http::HeaderMap::new();
		let err = verify(Some(&key), ClientProtocol::OpenAI, &headers).unwrap_err();
		assert_eq!(err.code, crate::error::ErrorCode::Unauthorized);
		assert_eq!(err.status, 401);
	}
}
