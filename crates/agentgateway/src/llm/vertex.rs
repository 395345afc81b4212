//! Google Vertex AI adapter: `contents`/`parts[].text` request shape,
//! `candidates[]` response shape, JSON-Lines streaming.
//! Path composition follows the `/v1/projects/{project}/locations/{region}/
//! publishers/google/models/{model}:generateContent` convention.

use agent_core::prelude::*;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::llm::{Adapter, BuiltRequest};
use crate::types::backend::{Backend, Protocol};
use crate::types::message::Message;
use crate::types::response::{Choice, Response, Usage};
use crate::types::{Request, StreamChunk};

pub struct VertexAdapter;

/// `STOP → stop`, `MAX_TOKENS → length`,
/// `SAFETY,RECITATION,MEDIA_INPUT → content_filter`, `EMPTY → stop`
///.
fn map_finish_reason(reason: &str) -> Strng {
	match reason {
		"STOP" | "EMPTY" => strng::literal("stop"),
		"MAX_TOKENS" => strng::literal("length"),
		"SAFETY" | "RECITATION" | "MEDIA_INPUT" => strng::literal("content_filter"),
		other => strng::new(other.to_lowercase()),
	}
}

fn role_for(m: &Message) -> &'static str {
	if m.is_role("assistant") || m.is_role("model") {
		"model"
	} else {
		"user"
	}
}

fn content_to_text(content: &Value) -> String {
	match content {
		Value::String(s) => s.clone(),
		Value::Array(parts) => parts
			.iter()
			.filter_map(|p| p.get("text").and_then(Value::as_str))
			.collect::<Vec<_>>()
			.join(""),
		_ => String::new(),
	}
}

/// Google requires `contents[].parts[].text` and may require joining the
/// system message into the first user turn — Vertex's
/// `generateContent` does accept a separate `systemInstruction`, but we
/// fold it into the first user turn rather than relying on that newer
/// field, matching how callers observe the system prompt applied in practice.
fn build_contents(req: &Request) -> Vec<Value> {
	let mut system_text = String::new();
	let mut contents = Vec::new();
	let mut joined_system = false;

	for m in &req.messages {
		if m.is_role("system") {
			if !system_text.is_empty() {
				system_text.push_str("\n\n");
			}
			system_text.push_str(&content_to_text(&m.content));
			continue;
		}

		let mut text = content_to_text(&m.content);
		if !system_text.is_empty() && !joined_system && role_for(m) == "user" {
			text = format!("{system_text}\n\n{text}");
			joined_system = true;
		}

		contents.push(serde_json::json!({
			"role": role_for(m),
			"parts": [{"text": text}],
		}));
	}

	contents
}

impl Adapter for VertexAdapter {
	fn protocol(&self) -> Protocol {
		Protocol::Vertex
	}

	fn name(&self) -> &'static str {
		"vertex"
	}

	fn build_request(&self, req: &Request, backend: &Backend, backend_model: &str) -> Result<BuiltRequest, Error> {
		let project_id = backend
			.project_id
			.clone()
			.ok_or_else(|| Error::internal(strng::literal("vertex backend missing projectId")))?;
		let region = backend.region.clone().unwrap_or_else(|| strng::literal("global"));

		let contents = build_contents(req);
		let mut generation_config = serde_json::Map::new();
		if let Some(v) = req.params.max_tokens {
			generation_config.insert("maxOutputTokens".to_string(), Value::from(v));
		}
		if let Some(v) = req.params.temperature {
			generation_config.insert("temperature".to_string(), Value::from(v));
		}
		if let Some(v) = req.params.top_p {
			generation_config.insert("topP".to_string(), Value::from(v));
		}

		let mut body = serde_json::Map::new();
		body.insert("contents".to_string(), Value::Array(contents));
		if !generation_config.is_empty() {
			body.insert("generationConfig".to_string(), Value::Object(generation_config));
		}

		let method = if req.stream { "streamGenerateContent" } else { "generateContent" };
		let path = strng::new(format!(
			"/v1/projects/{project_id}/locations/{region}/publishers/google/models/{backend_model}:{method}"
		));

		let bytes = serde_json::to_vec(&body).map_err(|e| Error::invalid_json(strng::new(e.to_string())))?;
		Ok(BuiltRequest {
			path,
			headers: Vec::new(),
			body: Bytes::from(bytes),
		})
	}

	fn parse_response(&self, body: &[u8], requested_model: &str) -> Option<Response> {
		let v: Value = serde_json::from_slice(body).ok()?;
		let obj = v.as_object()?;

		let candidates = obj.get("candidates").and_then(Value::as_array);
		let first = candidates.and_then(|c| c.first());

		let (text, finish_reason) = match first {
			Some(candidate) => {
				let text = candidate
					.get("content")
					.and_then(|c| c.get("parts"))
					.and_then(Value::as_array)
					.map(|parts| {
						parts
							.iter()
							.filter_map(|p| p.get("text").and_then(Value::as_str))
							.collect::<Vec<_>>()
							.join("")
					})
					.unwrap_or_default();
				let finish_reason = candidate.get("finishReason").and_then(Value::as_str).map(map_finish_reason);
				(text, finish_reason)
			},
			None => (String::new(), None),
		};

		let usage = obj
			.get("usageMetadata")
			.map(|u| Usage {
				prompt_tokens: u.get("promptTokenCount").and_then(Value::as_u64),
				completion_tokens: u.get("candidatesTokenCount").and_then(Value::as_u64),
				total_tokens: u.get("totalTokenCount").and_then(Value::as_u64),
			})
			.unwrap_or_default()
			.normalize();

		let mut extra = obj.clone();
		for k in ["candidates", "usageMetadata"] {
			extra.remove(k);
		}

		Some(Response {
			id: strng::literal("vertex"),
			model: strng::new(requested_model),
			choices: vec![Choice {
				index: 0,
				message: Message {
					role: strng::literal("assistant"),
					content: Value::String(text),
					tool_calls: None,
					tool_call_id: None,
					cache_control: None,
					extra: Map::new(),
				},
				finish_reason,
			}],
			usage,
			headers: Vec::new(),
			extra,
		})
	}

	/// Vertex streams JSON-Lines records, not SSE; terminal is signalled by
	/// presence of `usageMetadata`.
	fn parse_stream_chunk(&self, frame: &[u8]) -> Option<StreamChunk> {
		let v: Value = serde_json::from_slice(frame).ok()?;
		if v.get("usageMetadata").is_some() {
			let finish_reason = v
				.get("candidates")
				.and_then(Value::as_array)
				.and_then(|c| c.first())
				.and_then(|c| c.get("finishReason"))
				.and_then(Value::as_str)
				.map(map_finish_reason);
			return Some(StreamChunk::Terminal { finish_reason });
		}
		let text = v
			.get("candidates")
			.and_then(Value::as_array)
			.and_then(|c| c.first())
			.and_then(|c| c.get("content"))
			.and_then(|c| c.get("parts"))
			.and_then(Value::as_array)
			.and_then(|p| p.first())
			.and_then(|p| p.get("text"))
			.and_then(Value::as_str)
			.unwrap_or("");
		Some(StreamChunk::Delta {
			content: strng::new(text),
			role: None,
		})
	}

	fn is_stream_terminal(&self, frame: &[u8]) -> bool {
		serde_json::from_slice::<Value>(frame)
			.ok()
			.map(|v| v.get("usageMetadata").is_some())
			.unwrap_or(false)
	}

	fn convert_error(&self, status: u16, body: &[u8]) -> Error {
		let message = serde_json::from_slice::<Value>(body)
			.ok()
			.and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
			.unwrap_or_else(|| format!("vertex backend returned status {status}"));
		Error::from_backend_status(status, strng::literal("vertex"), strng::new(message))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::request::{ClientProtocol, Request};
	use serde_json::json;

	fn backend() -> Backend {
		Backend {
			name: strng::literal("b1"),
			base_url: strng::literal("https://aiplatform.googleapis.com"),
			api_key: secrecy::SecretString::from("k".to_string()),
			enabled: true,
			protocol: Protocol::Vertex,
			locale: None,
			weight: None,
			priority: None,
			connect_timeout_ms: None,
			request_timeout_ms: None,
			api_version: None,
			project_id: Some(strng::literal("proj-1")),
			region: Some(strng::literal("us-central1")),
		}
	}

	#[test]
	fn joins_system_into_first_user_turn() {
		let req = Request::from_body(
			strng::literal("r1"),
			json!({
				"model": "gemini-pro",
				"messages": [
					{"role": "system", "content": "be terse"},
					{"role": "user", "content": "hi"},
				]
			}),
			ClientProtocol::OpenAI,
			vec![],
		)
		.unwrap();
		let built = VertexAdapter.build_request(&req, &backend(), "gemini-1.5-pro").unwrap();
		let body: Value = serde_json::from_slice(&built.body).unwrap();
		let first_text = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
		assert!(first_text.contains("be terse"));
		assert!(first_text.contains("hi"));
		assert!(built.path.contains("proj-1"));
		assert!(built.path.contains("us-central1"));
	}

	#[test]
	fn finish_reason_mapping() {
		let body = json!({
			"candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "SAFETY"}],
			"usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1, "totalTokenCount": 3},
		});
		let resp = VertexAdapter.parse_response(&serde_json::to_vec(&body).unwrap(), "gemini-1.5-pro").unwrap();
		assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("content_filter"));
		assert_eq!(resp.choices[0].message.text(), "hi");
	}

	#[test]
	fn usage_metadata_marks_stream_terminal() {
		let frame = json!({"usageMetadata": {"totalTokenCount": 1}});
		assert!(VertexAdapter.is_stream_terminal(&serde_json::to_vec(&frame).unwrap()));
	}
}
