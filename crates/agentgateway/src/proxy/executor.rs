//! Fallback Executor: drives one request through its
//! candidate list under retry, backoff, cooldown and circuit-breaker
//! policy. The single place in the system that classifies an error as
//! terminal vs retriable — adapters only label, the executor decides.

use std::time::Duration;

use agent_core::prelude::*;
use rand::Rng;

use crate::config::Config;
use crate::error::{Error, ErrorCode, ErrorType};
use crate::health::{BackendHealthRecord, CircuitConfig, HealthRegistry, InFlightGuard};
use crate::llm::Registry;
use crate::router::Router;
use crate::telemetry::BodyLogSink;
use crate::types::backend::RouteCandidate;
use crate::types::{Request, Response};

/// Cap on how much of an upstream body the executor buffers for a
/// non-streaming response before giving up — guards against a
/// misbehaving backend streaming an unbounded body into memory.
const MAX_BUFFERED_BODY: usize = 32 * 1024 * 1024;

pub struct Executor<'a> {
	pub client: &'a crate::client::Client,
	pub adapters: &'a Registry,
	pub health: &'a HealthRegistry,
	pub config: &'a Config,
	pub body_log: &'a dyn BodyLogSink,
}

/// Outcome of resolving + attempting the first eligible candidate for a
/// streaming request: the executor commits to whichever backend answers
/// with a status line < 400 and hands the live connection
/// back to the caller instead of buffering it.
///
/// `guard` and `circuit` travel with the response body rather than being
/// released here: the in-flight slot (and the HalfOpen single-trial gate)
/// must stay held until the stream itself finishes, not merely until the
/// backend answers the status line.
pub struct StreamStart {
	pub backend: RouteCandidate,
	pub response: http::Response<hyper::body::Incoming>,
	pub guard: InFlightGuard,
	pub circuit: CircuitConfig,
}

impl<'a> Executor<'a> {
	fn candidates(&self, req: &Request) -> Result<Vec<RouteCandidate>, Error> {
		let router = Router::new(self.config, self.health);
		router.resolve(&req.model_alias)
	}

	async fn backoff(&self, attempt: usize, cancellation: &tokio_util::sync::CancellationToken) {
		let base = self.config.backoff_base.as_secs_f64();
		let delay = (base * self.config.backoff_multiplier.powi(attempt as i32)).min(self.config.backoff_max_delay.as_secs_f64());
		let jitter_frac = self.config.backoff_jitter.clamp(0.0, 1.0);
		let jitter = if jitter_frac > 0.0 { rand::rng().random_range(0.0..=(delay * jitter_frac)) } else { 0.0 };
		let total = Duration::from_secs_f64((delay + jitter).max(0.0));
		tokio::select! {
			biased;
			_ = cancellation.cancelled() => {},
			_ = tokio::time::sleep(total) => {},
		}
	}

	async fn buffer_body(resp: http::Response<hyper::body::Incoming>) -> Result<(u16, Vec<u8>), Error> {
		use http_body_util::BodyExt;
		let status = resp.status().as_u16();
		let collected = http_body_util::Limited::new(resp.into_body(), MAX_BUFFERED_BODY)
			.collect()
			.await
			.map_err(|_| Error::internal(strng::literal("upstream body exceeded buffering limit")))?;
		Ok((status, collected.to_bytes().to_vec()))
	}

	/// Upstream response headers worth preserving on the canonical `Response`:
	/// hop-by-hop headers are stripped, as are `content-type`/`content-length`,
	/// which describe the *upstream* body and must not leak onto the
	/// re-rendered body this proxy sends to its own client.
	fn response_headers(headers: &http::HeaderMap) -> Vec<(Strng, Strng)> {
		headers
			.iter()
			.filter(|(name, _)| {
				!crate::llm::is_hop_by_hop(name.as_str()) && name.as_str() != http::header::CONTENT_TYPE.as_str() && name.as_str() != http::header::CONTENT_LENGTH.as_str()
			})
			.filter_map(|(name, value)| value.to_str().ok().map(|v| (strng::new(name.as_str()), strng::new(v))))
			.collect()
	}

	/// Non-streaming request lifecycle.
	pub async fn execute(&self, req: &Request) -> Result<Response, Error> {
		let candidates = self.candidates(req)?;
		let max_attempts = candidates.len().min(self.config.max_retries as usize + 1);
		let mut last_err: Option<Error> = None;

		for (attempt, candidate) in candidates.iter().take(max_attempts).enumerate() {
			if req.cancellation.is_cancelled() {
				return Err(Error::internal(strng::literal("request cancelled")).retryable(false));
			}

			let health = self.health.get_or_insert(&candidate.backend.name);
			let Some(guard) = BackendHealthRecord::try_acquire(&health, self.config.in_flight_limit) else {
				last_err = Some(Error::concurrency_limit(candidate.backend.name.clone()));
				continue;
			};

			let adapter = self.adapters.get(candidate.backend.protocol);
			let built = match adapter.build_request(req, &candidate.backend, &candidate.backend_model) {
				Ok(b) => b,
				Err(e) => return Err(e.with_backend(candidate.backend.name.clone()).with_attempt(attempt as u32)),
			};

			let sent = self
				.client
				.send(
					&candidate.backend,
					&built.path,
					&req.forwarded_headers,
					built.body,
					self.config.attempt_timeout,
					&req.cancellation,
				)
				.await;

			let result = async {
				let resp = sent?;
				let headers = Self::response_headers(resp.headers());
				let (status, body) = Self::buffer_body(resp).await?;
				self.body_log.record(&req.req_id, &candidate.backend.name, &body);
				if status >= 400 {
					return Err(adapter.convert_error(status, &body));
				}
				match adapter.parse_response(&body, &candidate.backend_model) {
					Some(mut parsed) => {
						parsed.headers = headers;
						Ok(parsed)
					},
					None => Err(
						Error::new(ErrorType::Protocol, ErrorCode::ProtocolConversion, strng::literal("unparseable upstream response"))
							.retryable(true),
					),
				}
			}
			.await;

			drop(guard);

			match result {
				Ok(parsed) => {
					health.record_success(&self.config.circuit);
					return Ok(parsed);
				},
				Err(err) => {
					let err = err.with_backend(candidate.backend.name.clone()).with_attempt(attempt as u32);
					health.record_failure(&self.config.circuit, err.retryable);
					if !err.retryable {
						return Err(err);
					}
					last_err = Some(err);
					self.backoff(attempt, &req.cancellation).await;
				},
			}
		}

		Err(last_err.unwrap_or_else(|| Error::no_backend("no eligible candidates")))
	}

	/// Streaming request lifecycle: commit to the first
	/// backend whose status line is < 400. Once committed, a transport
	/// failure mid-stream is not retried — the caller gets whatever bytes
	/// were already forwarded.
	pub async fn start_stream(&self, req: &Request) -> Result<StreamStart, Error> {
		let candidates = self.candidates(req)?;
		let max_attempts = candidates.len().min(self.config.max_retries as usize + 1);
		let mut last_err: Option<Error> = None;

		for (attempt, candidate) in candidates.iter().take(max_attempts).enumerate() {
			if req.cancellation.is_cancelled() {
				return Err(Error::internal(strng::literal("request cancelled")).retryable(false));
			}

			let health = self.health.get_or_insert(&candidate.backend.name);
			let Some(guard) = BackendHealthRecord::try_acquire(&health, self.config.in_flight_limit) else {
				last_err = Some(Error::concurrency_limit(candidate.backend.name.clone()));
				continue;
			};

			let adapter = self.adapters.get(candidate.backend.protocol);
			let built = match adapter.build_request(req, &candidate.backend, &candidate.backend_model) {
				Ok(b) => b,
				Err(e) => {
					drop(guard);
					return Err(e.with_backend(candidate.backend.name.clone()).with_attempt(attempt as u32));
				},
			};

			let sent = self
				.client
				.send(
					&candidate.backend,
					&built.path,
					&req.forwarded_headers,
					built.body,
					self.config.attempt_timeout,
					&req.cancellation,
				)
				.await;

			match sent {
				Ok(resp) if (resp.status().as_u16()) < 400 => {
					// Committed to this backend. The in-flight slot and the success
					// bookkeeping both travel with the response body and are only
					// released/recorded once the stream actually finishes reading —
					// not here, where only the status line has arrived.
					return Ok(StreamStart {
						backend: candidate.clone(),
						response: resp,
						guard,
						circuit: self.config.circuit,
					});
				},
				Ok(resp) => {
					let status = resp.status().as_u16();
					let (_, body) = Self::buffer_body(resp).await.unwrap_or((status, Vec::new()));
					self.body_log.record(&req.req_id, &candidate.backend.name, &body);
					let err = adapter.convert_error(status, &body).with_backend(candidate.backend.name.clone()).with_attempt(attempt as u32);
					health.record_failure(&self.config.circuit, err.retryable);
					drop(guard);
					if !err.retryable {
						return Err(err);
					}
					last_err = Some(err);
					self.backoff(attempt, &req.cancellation).await;
				},
				Err(err) => {
					let err = err.with_backend(candidate.backend.name.clone()).with_attempt(attempt as u32);
					health.record_failure(&self.config.circuit, err.retryable);
					drop(guard);
					if !err.retryable {
						return Err(err);
					}
					last_err = Some(err);
					self.backoff(attempt, &req.cancellation).await;
				},
			}
		}

		Err(last_err.unwrap_or_else(|| Error::no_backend("no eligible candidates")))
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::config::Config;
	use crate::health::HealthRegistry;
	use crate::llm::Registry;
	use crate::telemetry::RingBufferSink;
	use crate::types::request::ClientProtocol;

	fn config(backend_url: &str) -> Config {
		let yaml = format!(
			r#"
backends:
  - name: b1
    baseUrl: {backend_url}
    apiKey: sk-1
    protocol: open-ai
aliases:
  - name: gpt-4
    routes:
      - {{ backend: b1, model: gpt-4o, priority: 0, weight: 1 }}
"#
		);
		Config::from_yaml_str(&yaml).expect("valid config")
	}

	#[tokio::test]
	async fn response_headers_are_populated_sans_hop_by_hop_and_content_type() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(serde_json::json!({
						"id": "x",
						"choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
					}))
					.insert_header("x-request-id", "upstream-req-1")
					.insert_header("connection", "keep-alive"),
			)
			.mount(&server)
			.await;

		let cfg = config(&server.uri());
		let client = crate::client::Client::new();
		let health = HealthRegistry::new();
		let adapters = Registry::new();
		let body_log = RingBufferSink::default();
		let exec = Executor {
			client: &client,
			adapters: &adapters,
			health: &health,
			config: &cfg,
			body_log: &body_log,
		};

		let req = Request::from_body(
			strng::literal("r1"),
			serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
			ClientProtocol::OpenAI,
			vec![],
		)
		.unwrap();

		let resp = exec.execute(&req).await.unwrap();
		assert!(resp.headers.iter().any(|(k, v)| k == "x-request-id" && v == "upstream-req-1"));
		assert!(!resp.headers.iter().any(|(k, _)| k == "connection"));
		assert!(!resp.headers.iter().any(|(k, _)| k == "content-type"));
	}
}
