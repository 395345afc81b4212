use std::time::Instant;

use agent_core::prelude::*;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
	OpenAI,
	Anthropic,
}

/// Typed parameters lifted out of the client's raw JSON body. Residual
/// fields the proxy doesn't recognize live in `Request::raw` and must
/// round-trip into the backend payload verbatim.
#[derive(Debug, Clone, Default)]
pub struct Params {
	pub max_tokens: Option<u64>,
	pub temperature: Option<f64>,
	pub top_p: Option<f64>,
	pub stop: Option<Value>,
	pub tools: Option<Value>,
	pub tool_choice: Option<Value>,
	pub user: Option<Strng>,
}

/// A validated, immutable inbound request. Construction enforces: non-empty
/// alias, non-empty ordered messages, each message has a non-empty role.
#[derive(Debug, Clone)]
pub struct Request {
	pub req_id: Strng,
	/// The full client body, preserved for pass-through reconstruction.
	pub raw: Map<String, Value>,
	pub model_alias: Strng,
	pub messages: Vec<Message>,
	pub params: Params,
	pub stream: bool,
	pub forwarded_headers: Vec<(Strng, Strng)>,
	pub client_protocol: ClientProtocol,
	pub cancellation: CancellationToken,
	pub start: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestBuildError {
	#[error("request body must be a JSON object")]
	NotAnObject,
	#[error("missing or empty `model`")]
	MissingModel,
	#[error("`messages` must be a non-empty array")]
	MissingMessages,
	#[error("message at index {0} has an empty role")]
	EmptyRole(usize),
	#[error("invalid message shape at index {0}")]
	InvalidMessage(usize),
}

impl Request {
	pub fn from_body(
		req_id: Strng,
		body: Value,
		client_protocol: ClientProtocol,
		forwarded_headers: Vec<(Strng, Strng)>,
	) -> Result<Self, RequestBuildError> {
		let Value::Object(mut raw) = body else {
			return Err(RequestBuildError::NotAnObject);
		};

		let model_alias = raw
			.get("model")
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.map(strng::new)
			.ok_or(RequestBuildError::MissingModel)?;

		let messages_value = raw
			.remove("messages")
			.and_then(|v| if let Value::Array(a) = v { Some(a) } else { None })
			.filter(|a| !a.is_empty())
			.ok_or(RequestBuildError::MissingMessages)?;

		// Anthropic-dialect bodies carry `system` as a top-level field rather
		// than a `role:"system"` message; fold it into the canonical message
		// list so every adapter can treat `messages` uniformly.
		let leading_system = raw.remove("system").map(|v| Message {
			role: strng::literal("system"),
			content: v,
			tool_calls: None,
			tool_call_id: None,
			cache_control: None,
			extra: Map::new(),
		});

		let mut messages = Vec::with_capacity(messages_value.len() + 1);
		messages.extend(leading_system);
		for (i, m) in messages_value.into_iter().enumerate() {
			let Value::Object(mut obj) = m else {
				return Err(RequestBuildError::InvalidMessage(i));
			};
			let role = obj
				.remove("role")
				.and_then(|v| v.as_str().map(strng::new))
				.filter(|s| !s.is_empty())
				.ok_or(RequestBuildError::EmptyRole(i))?;
			let content = obj.remove("content").unwrap_or(Value::Null);
			let tool_calls = obj.remove("tool_calls");
			let tool_call_id = obj.remove("tool_call_id").and_then(|v| v.as_str().map(strng::new));
			let cache_control = obj.remove("cache_control");
			// Whatever's left (e.g. OpenAI's `name` field on function/tool
			// messages) isn't a field this type names, but it must still reach
			// the backend verbatim.
			messages.push(Message {
				role,
				content,
				tool_calls,
				tool_call_id,
				cache_control,
				extra: obj,
			});
		}
		// put messages back into raw so adapters that want the original shape
		// can still find it under the same key.
		raw.insert(
			"messages".to_string(),
			Value::Array(
				messages
					.iter()
					.map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
					.collect(),
			),
		);

		let stream = raw.get("stream").and_then(Value::as_bool).unwrap_or(false);

		let params = Params {
			max_tokens: raw.get("max_tokens").and_then(Value::as_u64),
			temperature: raw.get("temperature").and_then(Value::as_f64),
			top_p: raw.get("top_p").and_then(Value::as_f64),
			stop: raw.get("stop").cloned(),
			tools: raw.get("tools").cloned(),
			tool_choice: raw.get("tool_choice").cloned(),
			user: raw.get("user").and_then(Value::as_str).map(strng::new),
		};

		Ok(Self {
			req_id,
			raw,
			model_alias,
			messages,
			params,
			stream,
			forwarded_headers,
			client_protocol,
			cancellation: CancellationToken::new(),
			start: Instant::now(),
		})
	}

	pub fn elapsed(&self) -> std::time::Duration {
		self.start.elapsed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn build(body: Value) -> Result<Request, RequestBuildError> {
		Request::from_body(strng::literal("req-1"), body, ClientProtocol::OpenAI, vec![])
	}

	#[test]
	fn rejects_missing_model() {
		let err = build(json!({"messages": [{"role": "user", "content": "hi"}]})).unwrap_err();
		assert!(matches!(err, RequestBuildError::MissingModel));
	}

	#[test]
	fn rejects_empty_messages() {
		let err = build(json!({"model": "gpt-4", "messages": []})).unwrap_err();
		assert!(matches!(err, RequestBuildError::MissingMessages));
	}

	#[test]
	fn rejects_empty_role() {
		let err = build(json!({"model": "gpt-4", "messages": [{"role": "", "content": "hi"}]})).unwrap_err();
		assert!(matches!(err, RequestBuildError::EmptyRole(0)));
	}

	#[test]
	fn preserves_unknown_fields() {
		let req = build(json!({
			"model": "gpt-4",
			"messages": [{"role": "user", "content": "hi"}],
			"logit_bias": {"123": 1},
		}))
		.unwrap();
		assert!(req.raw.contains_key("logit_bias"));
	}
}
