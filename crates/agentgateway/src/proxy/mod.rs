//! HTTP ingress: axum router, request/response plumbing, and the glue
//! between `crate::http`, `crate::llm`, `crate::router`/`health` and the
//! two execution paths below.

pub mod executor;
pub mod render;
pub mod stream;

use std::sync::Arc;

use agent_core::prelude::*;
use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::{get, post};
use serde_json::Value;

use crate::client::Client;
use crate::config::ConfigHandle;
use crate::error::Error;
use crate::health::HealthRegistry;
use crate::llm::Registry;
use crate::telemetry::BodyLogSink;
use crate::types::request::ClientProtocol;
use crate::types::{Request, backend::Protocol};

use executor::Executor;

/// Shared, cheaply-cloned application state handed to every handler.
/// `adapters` is `&'static` because a streaming response's body future must
/// itself be `'static`; `main` leaks the `Registry` once at startup to get
/// that lifetime.
pub struct AppState {
	pub config: ConfigHandle,
	pub health: HealthRegistry,
	pub client: Client,
	pub adapters: &'static Registry,
	pub body_log: Arc<dyn BodyLogSink>,
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
	axum::Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/messages", post(messages))
		.route("/v1/models", get(list_models))
		.route("/health", get(health))
		.with_state(state)
}

fn error_response(err: &Error, req_id: &str) -> AxumResponse {
	let status = http::StatusCode::from_u16(err.status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
	(status, Json(err.to_body(req_id))).into_response()
}

async fn ingress(state: Arc<AppState>, headers: http::HeaderMap, body: Value, client_protocol: ClientProtocol) -> AxumResponse {
	let req_id = strng::new(uuid::Uuid::new_v4().to_string());

	let config = state.config.current();
	if let Err(err) = crate::http::apikey::verify(config.proxy_key.as_ref(), client_protocol, &headers) {
		return error_response(&err, &req_id);
	}

	let forwarded_headers = crate::http::extract_forwarded_headers(&headers);
	let req = match Request::from_body(req_id.clone(), body, client_protocol, forwarded_headers) {
		Ok(req) => req,
		Err(e) => return error_response(&Error::bad_request(strng::new(e.to_string())), &req_id),
	};

	tracing::info! {
		req_id = %req.req_id,
		model_alias = %req.model_alias,
		stream = req.stream,
		"request received",
	};

	let exec = Executor {
		client: &state.client,
		adapters: state.adapters,
		health: &state.health,
		config: &config,
		body_log: state.body_log.as_ref(),
	};

	if req.stream {
		handle_stream(&exec, &state, &req).await
	} else {
		handle_unary(&exec, &req).await
	}
}

async fn handle_unary(exec: &Executor<'_>, req: &Request) -> AxumResponse {
	match exec.execute(req).await {
		Ok(resp) => {
			let body = match req.client_protocol {
				ClientProtocol::OpenAI => render::to_openai_json(&resp),
				ClientProtocol::Anthropic => render::to_anthropic_json(&resp),
			};
			let mut out = (http::StatusCode::OK, Json(body)).into_response();
			for (name, value) in &resp.headers {
				let (Ok(name), Ok(value)) = (http::HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(value)) else {
					continue;
				};
				out.headers_mut().insert(name, value);
			}
			out
		},
		Err(err) => error_response(&err, &req.req_id),
	}
}

async fn handle_stream(exec: &Executor<'_>, state: &Arc<AppState>, req: &Request) -> AxumResponse {
	let start = match exec.start_stream(req).await {
		Ok(start) => start,
		Err(err) => return error_response(&err, &req.req_id),
	};

	let backend_protocol = start.backend.backend.protocol;
	let same_dialect = match req.client_protocol {
		ClientProtocol::OpenAI => backend_protocol.is_openai_compatible(),
		ClientProtocol::Anthropic => backend_protocol == Protocol::Anthropic,
	};
	let adapter = state.adapters.get(backend_protocol);
	let deadline = exec.config.streaming_deadline;

	stream::build_response(
		start.response.into_body(),
		adapter,
		req.client_protocol,
		same_dialect,
		req.req_id.clone(),
		start.backend.backend.name.clone(),
		req.cancellation.clone(),
		deadline,
		state.body_log.clone(),
		start.guard,
		start.circuit,
	)
}

async fn chat_completions(State(state): State<Arc<AppState>>, headers: http::HeaderMap, Json(body): Json<Value>) -> AxumResponse {
	ingress(state, headers, body, ClientProtocol::OpenAI).await
}

async fn messages(State(state): State<Arc<AppState>>, headers: http::HeaderMap, Json(body): Json<Value>) -> AxumResponse {
	ingress(state, headers, body, ClientProtocol::Anthropic).await
}

async fn list_models(State(state): State<Arc<AppState>>) -> AxumResponse {
	let config = state.config.current();
	let models: Vec<Value> = config
		.aliases
		.keys()
		.map(|name| serde_json::json!({"id": name.as_str(), "object": "model"}))
		.collect();
	Json(serde_json::json!({"object": "list", "data": models})).into_response()
}

/// Liveness only: 200 iff the process can read its
/// current config snapshot. No backend health is consulted here.
async fn health(State(state): State<Arc<AppState>>) -> AxumResponse {
	let _ = state.config.current();
	Json(serde_json::json!({"status": "ok"})).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_response_maps_status_from_error() {
		let err = Error::unauthorized(strng::literal("no key"));
		let resp = error_response(&err, "req-1");
		assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
	}
}
