//! OpenAI-compatible adapter. Handles OpenAI, Azure, DeepSeek, Groq,
//! Mistral and Cohere under one implementation: they share
//! the same request/response/stream shape and only differ in path/host,
//! which Azure's `api_version`/deployment-scoped path override covers.

use agent_core::prelude::*;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::llm::{Adapter, BuiltRequest};
use crate::types::backend::{Backend, Protocol};
use crate::types::message::Message;
use crate::types::request::ClientProtocol;
use crate::types::response::{Choice, Response, Usage};
use crate::types::{Request, StreamChunk};

/// Build the `messages` array fresh from the canonical message list. Used
/// whenever the client's dialect doesn't already match the backend's, since
/// `req.raw` is then shaped for the *client's* dialect, not this one.
fn messages_from_canonical(req: &Request) -> Value {
	Value::Array(
		req
			.messages
			.iter()
			.map(|m| {
				let mut obj = serde_json::Map::new();
				obj.insert("role".to_string(), Value::String(m.role.to_string()));
				obj.insert("content".to_string(), m.content.clone());
				if let Some(tc) = &m.tool_calls {
					obj.insert("tool_calls".to_string(), tc.clone());
				}
				if let Some(id) = &m.tool_call_id {
					obj.insert("tool_call_id".to_string(), Value::String(id.to_string()));
				}
				Value::Object(obj)
			})
			.collect(),
	)
}

pub struct OpenAIAdapter;

fn chat_completions_path(backend: &Backend, backend_model: &str) -> Strng {
	match backend.protocol {
		Protocol::Azure => {
			let api_version = backend.api_version.as_deref().unwrap_or("2024-10-21");
			strng::new(format!(
				"/openai/deployments/{backend_model}/chat/completions?api-version={api_version}"
			))
		},
		_ => strng::literal("/v1/chat/completions"),
	}
}

/// `end_turn`/`stop_sequence` → `stop`, etc. This table is only consulted
/// if an OpenAI-compatible backend ever emits a non-OpenAI finish reason
/// (some compat providers do); most pass one of OpenAI's own values
/// through untouched.
fn normalize_finish_reason(reason: &str) -> Strng {
	match reason {
		"end_turn" | "stop_sequence" => strng::literal("stop"),
		"max_tokens" => strng::literal("length"),
		"refusal" => strng::literal("content_filter"),
		other => strng::new(other),
	}
}

impl Adapter for OpenAIAdapter {
	fn protocol(&self) -> Protocol {
		Protocol::OpenAI
	}

	fn name(&self) -> &'static str {
		"openai"
	}

	fn supports(&self, p: Protocol) -> bool {
		p.is_openai_compatible()
	}

	fn build_request(&self, req: &Request, backend: &Backend, backend_model: &str) -> Result<BuiltRequest, Error> {
		// Body pass-through: when the client already spoke our
		// dialect, every residual key in its raw body must survive verbatim.
		let mut body = if req.client_protocol == ClientProtocol::OpenAI {
			req.raw.clone()
		} else {
			let mut fresh = serde_json::Map::new();
			fresh.insert("messages".to_string(), messages_from_canonical(req));
			if let Some(v) = req.params.max_tokens {
				fresh.insert("max_tokens".to_string(), Value::from(v));
			}
			if let Some(v) = req.params.temperature {
				fresh.insert("temperature".to_string(), Value::from(v));
			}
			if let Some(v) = req.params.top_p {
				fresh.insert("top_p".to_string(), Value::from(v));
			}
			if let Some(v) = &req.params.stop {
				fresh.insert("stop".to_string(), v.clone());
			}
			if let Some(v) = &req.params.tools {
				fresh.insert("tools".to_string(), v.clone());
			}
			if let Some(v) = &req.params.tool_choice {
				fresh.insert("tool_choice".to_string(), v.clone());
			}
			if let Some(v) = &req.params.user {
				fresh.insert("user".to_string(), Value::String(v.to_string()));
			}
			fresh
		};
		body.insert("model".to_string(), Value::String(backend_model.to_string()));
		body.insert("stream".to_string(), Value::Bool(req.stream));

		let path = chat_completions_path(backend, backend_model);
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

		let id = obj.get("id").and_then(Value::as_str).map(strng::new).unwrap_or_else(|| strng::literal("unknown"));
		let model = obj
			.get("model")
			.and_then(Value::as_str)
			.map(strng::new)
			.unwrap_or_else(|| strng::new(requested_model));

		let choices = obj
			.get("choices")
			.and_then(Value::as_array)
			.map(|arr| {
				arr
					.iter()
					.enumerate()
					.filter_map(|(i, c)| {
						let message_v = c.get("message")?;
						let role = message_v.get("role").and_then(Value::as_str).map(strng::new).unwrap_or_else(|| strng::literal("assistant"));
						let content = message_v.get("content").cloned().unwrap_or(Value::Null);
						let tool_calls = message_v.get("tool_calls").cloned();
						let finish_reason = c.get("finish_reason").and_then(Value::as_str).map(normalize_finish_reason);
						Some(Choice {
							index: c.get("index").and_then(Value::as_u64).unwrap_or(i as u64) as u32,
							message: Message {
								role,
								content,
								tool_calls,
								tool_call_id: None,
								cache_control: None,
								extra: Map::new(),
							},
							finish_reason,
						})
					})
					.collect()
			})
			.unwrap_or_default();

		let usage = obj
			.get("usage")
			.map(|u| Usage {
				prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64),
				completion_tokens: u.get("completion_tokens").and_then(Value::as_u64),
				total_tokens: u.get("total_tokens").and_then(Value::as_u64),
			})
			.unwrap_or_default()
			.normalize();

		let mut extra = obj.clone();
		for k in ["id", "model", "choices", "usage"] {
			extra.remove(k);
		}

		Some(Response {
			id,
			model,
			choices,
			usage,
			headers: Vec::new(),
			extra,
		})
	}

	fn parse_stream_chunk(&self, frame: &[u8]) -> Option<StreamChunk> {
		let trimmed = std::str::from_utf8(frame).ok()?.trim();
		if trimmed == "[DONE]" {
			return Some(StreamChunk::Terminal { finish_reason: None });
		}
		let v: Value = serde_json::from_str(trimmed).ok()?;
		let choice = v.get("choices")?.as_array()?.first()?;
		if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
			return Some(StreamChunk::Terminal {
				finish_reason: Some(normalize_finish_reason(reason)),
			});
		}
		let delta = choice.get("delta")?;
		if let Some(tool_calls) = delta.get("tool_calls") {
			return Some(StreamChunk::ToolCallDelta { raw: tool_calls.clone() });
		}
		let content = delta.get("content").and_then(Value::as_str).unwrap_or("");
		let role = delta.get("role").and_then(Value::as_str).map(strng::new);
		Some(StreamChunk::Delta {
			content: strng::new(content),
			role,
		})
	}

	fn is_stream_terminal(&self, frame: &[u8]) -> bool {
		std::str::from_utf8(frame).map(|s| s.trim() == "[DONE]").unwrap_or(false)
	}

	fn convert_error(&self, status: u16, body: &[u8]) -> Error {
		let message = serde_json::from_slice::<Value>(body)
			.ok()
			.and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
			.unwrap_or_else(|| format!("openai-compatible backend returned status {status}"));
		Error::from_backend_status(status, strng::literal("openai"), strng::new(message))
	}
}
