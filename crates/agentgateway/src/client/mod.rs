//! Backend Client: builds, signs, and sends one HTTP request
//! to one backend. Holds a shared connection pool and resolver but no
//! per-request state — everything request-scoped (headers, body, deadline,
//! cancellation) is passed in by the caller.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use agent_core::prelude::*;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::llm::is_hop_by_hop;
use crate::types::backend::{Backend, Protocol};

type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
pub type Body = BoxBody<Bytes, Infallible>;

pub fn body_from_bytes(bytes: Bytes) -> Body {
	Full::new(bytes).map_err(|never: Infallible| match never {}).boxed()
}

/// Headers a caller is never allowed to override because the client owns
/// them: `Content-Type`, the credential header, and
/// `Accept-Language`.
fn is_client_owned(name: &str) -> bool {
	name.eq_ignore_ascii_case("content-type")
		|| name.eq_ignore_ascii_case("authorization")
		|| name.eq_ignore_ascii_case("x-api-key")
		|| name.eq_ignore_ascii_case("accept-language")
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_LOCALE: &str = "zh-CN";

/// Per-backend connectors are cached keyed by `connect_timeout_ms` so
/// backends that share a connect timeout (including the common "none
/// configured" case) share one connection pool, while a backend that sets
/// its own gets a connector built just for it.
#[derive(Clone)]
pub struct Client {
	connectors: std::sync::Arc<RwLock<HashMap<Option<u64>, LegacyClient<Connector, Body>>>>,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish()
	}
}

impl Default for Client {
	fn default() -> Self {
		Self::new()
	}
}

fn build_legacy_client(connect_timeout_ms: Option<u64>) -> LegacyClient<Connector, Body> {
	let mut http = HttpConnector::new();
	http.enforce_http(false);
	http.set_connect_timeout(connect_timeout_ms.map(Duration::from_millis));
	let https = HttpsConnectorBuilder::new()
		.with_webpki_roots()
		.https_or_http()
		.enable_http1()
		.enable_http2()
		.wrap_connector(http);
	LegacyClient::builder(TokioExecutor::new()).build(https)
}

impl Client {
	pub fn new() -> Self {
		let mut connectors = HashMap::with_capacity(1);
		connectors.insert(None, build_legacy_client(None));
		Self {
			connectors: std::sync::Arc::new(RwLock::new(connectors)),
		}
	}

	fn connector_for(&self, connect_timeout_ms: Option<u64>) -> LegacyClient<Connector, Body> {
		if let Some(existing) = self.connectors.read().get(&connect_timeout_ms) {
			return existing.clone();
		}
		let mut connectors = self.connectors.write();
		connectors.entry(connect_timeout_ms).or_insert_with(|| build_legacy_client(connect_timeout_ms)).clone()
	}

	/// Compose `base_url` + `path`: trim the base's trailing slash, the
	/// path's leading slash, join with one `/`.
	fn join_url(base_url: &str, path: &str) -> String {
		format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
	}

	fn build_headers(backend: &Backend, caller_headers: &[(Strng, Strng)]) -> Vec<(http::HeaderName, http::HeaderValue)> {
		let mut headers = Vec::with_capacity(caller_headers.len() + 3);
		headers.push((http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/json")));

		let locale = backend.locale.as_deref().unwrap_or(DEFAULT_LOCALE);
		if let Ok(v) = http::HeaderValue::from_str(locale) {
			headers.push((http::header::ACCEPT_LANGUAGE, v));
		}

		match backend.protocol {
			Protocol::Anthropic => {
				if let Ok(v) = http::HeaderValue::from_str(backend.api_key.expose_secret()) {
					headers.push((http::HeaderName::from_static("x-api-key"), v));
				}
				headers.push((
					http::HeaderName::from_static("anthropic-version"),
					http::HeaderValue::from_static(ANTHROPIC_VERSION),
				));
			},
			_ => {
				if let Ok(v) = http::HeaderValue::from_str(&format!("Bearer {}", backend.api_key.expose_secret())) {
					headers.push((http::header::AUTHORIZATION, v));
				}
			},
		}

		for (name, value) in caller_headers {
			if is_hop_by_hop(name) || is_client_owned(name) {
				continue;
			}
			let (Ok(name), Ok(value)) = (http::HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(value)) else {
				continue;
			};
			headers.push((name, value));
		}

		headers
	}

	/// Send one request. `default_deadline` is used unless the backend
	/// declares its own `request_timeout_ms`, which takes precedence; the
	/// backend's `connect_timeout_ms`, if set, bounds only the TCP/TLS
	/// handshake via a connector built specifically for it. Honours
	/// `cancellation`; transport failures (connect refused, timeout, DNS)
	/// come back as a retryable `Error::Backend`.
	pub async fn send(
		&self,
		backend: &Backend,
		path: &str,
		caller_headers: &[(Strng, Strng)],
		body: Bytes,
		default_deadline: Duration,
		cancellation: &CancellationToken,
	) -> Result<http::Response<hyper::body::Incoming>, Error> {
		let deadline = backend.request_timeout_ms.map(Duration::from_millis).unwrap_or(default_deadline);
		let url = Self::join_url(&backend.base_url, path);
		let mut builder = http::Request::builder().method(http::Method::POST).uri(&url);
		for (name, value) in Self::build_headers(backend, caller_headers) {
			builder = builder.header(name, value);
		}
		let req = builder
			.body(body_from_bytes(body))
			.map_err(|e| Error::internal(strng::new(format!("building backend request: {e}"))))?;

		let connector = self.connector_for(backend.connect_timeout_ms);
		let call = connector.request(req);
		let outcome = tokio::select! {
			biased;
			_ = cancellation.cancelled() => {
				return Err(
					Error::new(crate::error::ErrorType::Backend, crate::error::ErrorCode::BackendTimeout, strng::literal("request cancelled"))
						.retryable(false)
						.with_backend(backend.name.clone()),
				);
			},
			r = tokio::time::timeout(deadline, call) => r,
		};

		match outcome {
			Ok(Ok(resp)) => Ok(resp),
			Ok(Err(e)) => Err(
				Error::new(
					crate::error::ErrorType::Backend,
					crate::error::ErrorCode::BackendError,
					strng::new(format!("transport error: {e}")),
				)
				.with_status(502)
				.retryable(true)
				.with_backend(backend.name.clone()),
			),
			Err(_elapsed) => Err(
				Error::new(
					crate::error::ErrorType::Backend,
					crate::error::ErrorCode::BackendTimeout,
					strng::literal("backend request timed out"),
				)
				.with_status(504)
				.retryable(true)
				.with_backend(backend.name.clone()),
			),
		}
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn backend(base_url: &str, protocol: Protocol) -> Backend {
		Backend {
			name: strng::literal("b1"),
			base_url: strng::new(base_url),
			api_key: secrecy::SecretString::from("sk-test".to_string()),
			enabled: true,
			protocol,
			locale: None,
			weight: None,
			priority: None,
			connect_timeout_ms: None,
			request_timeout_ms: None,
			api_version: None,
			project_id: None,
			region: None,
		}
	}

	#[tokio::test]
	async fn injects_bearer_for_openai() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.and(header("authorization", "Bearer sk-test"))
			.and(header("content-type", "application/json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
			.mount(&server)
			.await;

		let client = Client::new();
		let resp = client
			.send(
				&backend(&server.uri(), Protocol::OpenAI),
				"/v1/chat/completions",
				&[],
				Bytes::from_static(b"{}"),
				Duration::from_secs(5),
				&CancellationToken::new(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), 200);
	}

	#[tokio::test]
	async fn injects_x_api_key_for_anthropic() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/messages"))
			.and(header("x-api-key", "sk-test"))
			.and(header("anthropic-version", ANTHROPIC_VERSION))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
			.mount(&server)
			.await;

		let client = Client::new();
		let resp = client
			.send(
				&backend(&server.uri(), Protocol::Anthropic),
				"/v1/messages",
				&[],
				Bytes::from_static(b"{}"),
				Duration::from_secs(5),
				&CancellationToken::new(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), 200);
	}

	#[tokio::test]
	async fn drops_hop_by_hop_and_client_owned_overrides() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.and(header("authorization", "Bearer sk-test"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;

		let client = Client::new();
		let caller_headers = vec![
			(strng::literal("connection"), strng::literal("keep-alive")),
			(strng::literal("authorization"), strng::literal("Bearer attacker-supplied")),
			(strng::literal("x-request-id"), strng::literal("req-1")),
		];
		let resp = client
			.send(
				&backend(&server.uri(), Protocol::OpenAI),
				"/v1/chat/completions",
				&caller_headers,
				Bytes::from_static(b"{}"),
				Duration::from_secs(5),
				&CancellationToken::new(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), 200);
	}

	#[tokio::test]
	async fn per_backend_request_timeout_overrides_default_deadline() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
			.mount(&server)
			.await;

		let mut b = backend(&server.uri(), Protocol::OpenAI);
		b.request_timeout_ms = Some(20);

		let client = Client::new();
		let err = client
			.send(&b, "/v1/chat/completions", &[], Bytes::from_static(b"{}"), Duration::from_secs(5), &CancellationToken::new())
			.await
			.unwrap_err();
		assert_eq!(err.status, 504);
	}

	#[test]
	fn join_url_trims_slashes() {
		assert_eq!(Client::join_url("https://api.openai.com/", "/v1/chat/completions"), "https://api.openai.com/v1/chat/completions");
		assert_eq!(Client::join_url("https://api.openai.com", "v1/chat/completions"), "https://api.openai.com/v1/chat/completions");
	}
}
