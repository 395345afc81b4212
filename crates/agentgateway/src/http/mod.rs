//! HTTP-boundary helpers shared by the ingress handlers in `crate::proxy`:
//! shared-proxy-key verification and the forwarded-header whitelist
//!.

pub mod apikey;

use agent_core::prelude::*;

/// Only these client headers are propagated to backends.
pub const FORWARDED_REQUEST_HEADERS: &[&str] =
	&["x-request-id", "x-forwarded-for", "x-real-ip", "user-agent", "accept", "accept-language", "accept-encoding"];

pub const DEFAULT_USER_AGENT: &str = "agentgateway-llm-proxy/1.0";

/// Extract the whitelisted subset of inbound headers to forward to the
/// backend, defaulting `User-Agent` when the caller didn't send one.
pub fn extract_forwarded_headers(headers: &http::HeaderMap) -> Vec<(Strng, Strng)> {
	let mut out = Vec::new();
	let mut saw_user_agent = false;
	for name in FORWARDED_REQUEST_HEADERS {
		if let Some(value) = headers.get(*name) {
			if let Ok(v) = value.to_str() {
				out.push((strng::new(*name), strng::new(v)));
				if *name == "user-agent" {
					saw_user_agent = true;
				}
			}
		}
	}
	if !saw_user_agent {
		out.push((strng::literal("user-agent"), strng::literal(DEFAULT_USER_AGENT)));
	}
	out
}
