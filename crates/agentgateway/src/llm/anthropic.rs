//! Anthropic adapter: `/v1/messages` wire shape, `x-api-key` credential
//! injection, typed SSE event framing, and content-block handling
//!.

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

pub struct AnthropicAdapter;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `stop_reason` → canonical finish reason.
fn map_stop_reason(reason: &str) -> Strng {
	match reason {
		"end_turn" | "stop_sequence" => strng::literal("stop"),
		"max_tokens" => strng::literal("length"),
		"refusal" => strng::literal("content_filter"),
		other => strng::new(other),
	}
}

/// True when the client asked for extended thinking (Anthropic's
/// `{"thinking": {"type": "enabled", ...}}` request field).
fn extended_thinking_enabled(req: &Request) -> bool {
	req.raw.get("thinking").and_then(|v| v.get("type")).and_then(Value::as_str) == Some("enabled")
}

/// LangChain-style convention some OpenAI-dialect clients use to carry a
/// model's reasoning trace across turns: `additional_kwargs.reasoning_content`
/// on the message object.
fn reasoning_content(m: &Message) -> Option<Value> {
	m.extra.get("additional_kwargs")?.get("reasoning_content").cloned()
}

/// Build `{system, messages}` from the canonical message list: system-role
/// messages are concatenated into the top-level `system` string (or joined
/// content-block array if any had structured content); everything else
/// becomes an Anthropic-shaped turn. Tool messages are remapped to a
/// `user` turn carrying a `tool_result` content block, matching how
/// Anthropic expects tool output to be threaded back in. When extended
/// thinking is enabled, an assistant turn that carries tool calls has its
/// `reasoning_content` lifted out of `additional_kwargs` to the top of the
/// turn, since Anthropic expects the thinking trace there rather than
/// nested under a provider-specific bag.
fn to_anthropic_messages(req: &Request) -> (Option<Value>, Vec<Value>) {
	let mut system_parts: Vec<String> = Vec::new();
	let mut messages = Vec::new();
	let extended_thinking = extended_thinking_enabled(req);

	for m in &req.messages {
		if m.is_role("system") {
			let text = m.text();
			if !text.is_empty() {
				system_parts.push(text);
			}
			continue;
		}

		if m.is_role("tool") {
			let mut block = serde_json::Map::new();
			block.insert("type".to_string(), Value::String("tool_result".to_string()));
			if let Some(id) = &m.tool_call_id {
				block.insert("tool_use_id".to_string(), Value::String(id.to_string()));
			}
			block.insert("content".to_string(), Value::String(m.text()));
			messages.push(serde_json::json!({
				"role": "user",
				"content": [Value::Object(block)],
			}));
			continue;
		}

		let role = if m.is_role("assistant") { "assistant" } else { "user" };
		let mut obj = serde_json::Map::new();
		obj.insert("role".to_string(), Value::String(role.to_string()));
		obj.insert("content".to_string(), m.content.clone());
		if extended_thinking && role == "assistant" && m.tool_calls.is_some() {
			if let Some(reasoning) = reasoning_content(m) {
				obj.insert("reasoning_content".to_string(), reasoning);
			}
		}
		messages.push(Value::Object(obj));
	}

	let system = if system_parts.is_empty() {
		None
	} else {
		Some(Value::String(system_parts.join("\n\n")))
	};
	(system, messages)
}

impl Adapter for AnthropicAdapter {
	fn protocol(&self) -> Protocol {
		Protocol::Anthropic
	}

	fn name(&self) -> &'static str {
		"anthropic"
	}

	fn build_request(&self, req: &Request, _backend: &Backend, backend_model: &str) -> Result<BuiltRequest, Error> {
		let mut body = if req.client_protocol == ClientProtocol::Anthropic {
			req.raw.clone()
		} else {
			let (system, messages) = to_anthropic_messages(req);
			let mut fresh = serde_json::Map::new();
			if let Some(system) = system {
				fresh.insert("system".to_string(), system);
			}
			fresh.insert("messages".to_string(), Value::Array(messages));
			if let Some(v) = req.params.max_tokens {
				fresh.insert("max_tokens".to_string(), Value::from(v));
			}
			if let Some(v) = req.params.temperature {
				fresh.insert("temperature".to_string(), Value::from(v));
			}
			if let Some(v) = req.params.top_p {
				fresh.insert("top_p".to_string(), Value::from(v));
			}
			if let Some(v) = &req.params.tools {
				fresh.insert("tools".to_string(), v.clone());
			}
			fresh
		};

		// Anthropic requires max_tokens; default it rather than fail the
		// request if the client omitted it (OpenAI makes it optional).
		if !body.contains_key("max_tokens") {
			body.insert("max_tokens".to_string(), Value::from(4096u64));
		}

		body.insert("model".to_string(), Value::String(backend_model.to_string()));
		body.insert("stream".to_string(), Value::Bool(req.stream));
		// system extracted from messages already; don't also carry a
		// role:"system" message into Anthropic's `messages` array.
		if let Some(Value::Array(msgs)) = body.get_mut("messages") {
			msgs.retain(|m| m.get("role").and_then(Value::as_str) != Some("system"));
		}

		let bytes = serde_json::to_vec(&body).map_err(|e| Error::invalid_json(strng::new(e.to_string())))?;
		Ok(BuiltRequest {
			path: strng::literal("/v1/messages"),
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

		// Concatenate `text` blocks; ignore thinking/image/document/
		// search_result for the text field but surface `tool_use` blocks as
		// tool_calls so round trips survive.
		let blocks = obj.get("content").and_then(Value::as_array).cloned().unwrap_or_default();
		let mut text = String::new();
		let mut tool_calls = Vec::new();
		for block in &blocks {
			match block.get("type").and_then(Value::as_str) {
				Some("text") => {
					if let Some(t) = block.get("text").and_then(Value::as_str) {
						text.push_str(t);
					}
				},
				Some("tool_use") => {
					tool_calls.push(serde_json::json!({
						"id": block.get("id").cloned().unwrap_or(Value::Null),
						"type": "function",
						"function": {
							"name": block.get("name").cloned().unwrap_or(Value::Null),
							"arguments": block.get("input").cloned().unwrap_or(Value::Null),
						}
					}));
				},
				_ => {},
			}
		}

		let finish_reason = obj.get("stop_reason").and_then(Value::as_str).map(map_stop_reason);

		let message = Message {
			role: strng::literal("assistant"),
			content: Value::String(text),
			tool_calls: if tool_calls.is_empty() { None } else { Some(Value::Array(tool_calls)) },
			tool_call_id: None,
			cache_control: None,
			extra: Map::new(),
		};

		let usage = obj
			.get("usage")
			.map(|u| Usage {
				prompt_tokens: u.get("input_tokens").and_then(Value::as_u64),
				completion_tokens: u.get("output_tokens").and_then(Value::as_u64),
				total_tokens: None,
			})
			.unwrap_or_default()
			.normalize();

		let mut extra = obj.clone();
		for k in ["id", "model", "content", "usage", "stop_reason"] {
			extra.remove(k);
		}

		Some(Response {
			id,
			model,
			choices: vec![Choice {
				index: 0,
				message,
				finish_reason,
			}],
			usage,
			headers: Vec::new(),
			extra,
		})
	}

	/// Anthropic SSE frames are typed: an `event:` line precedes each
	/// `data:` payload. The executor hands us only the `data:` payload; the
	/// event name is recovered from the payload's own `type` field, which
	/// Anthropic duplicates there.
	fn parse_stream_chunk(&self, frame: &[u8]) -> Option<StreamChunk> {
		let v: Value = serde_json::from_slice(frame).ok()?;
		match v.get("type").and_then(Value::as_str)? {
			"message_stop" => Some(StreamChunk::Terminal { finish_reason: None }),
			"message_delta" => {
				let reason = v.get("delta")?.get("stop_reason").and_then(Value::as_str).map(map_stop_reason);
				if reason.is_some() {
					Some(StreamChunk::Terminal { finish_reason: reason })
				} else {
					None
				}
			},
			"content_block_delta" => {
				let delta = v.get("delta")?;
				match delta.get("type").and_then(Value::as_str) {
					Some("text_delta") => Some(StreamChunk::Delta {
						content: strng::new(delta.get("text").and_then(Value::as_str).unwrap_or("")),
						role: None,
					}),
					Some("input_json_delta") => Some(StreamChunk::ToolCallDelta { raw: delta.clone() }),
					_ => None,
				}
			},
			_ => None,
		}
	}

	fn is_stream_terminal(&self, frame: &[u8]) -> bool {
		serde_json::from_slice::<Value>(frame)
			.ok()
			.and_then(|v| v.get("type").and_then(Value::as_str).map(|s| s == "message_stop"))
			.unwrap_or(false)
	}

	fn convert_error(&self, status: u16, body: &[u8]) -> Error {
		let message = serde_json::from_slice::<Value>(body)
			.ok()
			.and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
			.unwrap_or_else(|| format!("anthropic backend returned status {status}"));
		Error::from_backend_status(status, strng::literal("anthropic"), strng::new(message))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::backend::Backend;
	use crate::types::request::Request;
	use serde_json::json;

	fn backend() -> Backend {
		Backend {
			name: strng::literal("b1"),
			base_url: strng::literal("https://api.anthropic.com"),
			api_key: secrecy::SecretString::from("k".to_string()),
			enabled: true,
			protocol: Protocol::Anthropic,
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

	#[test]
	fn concatenates_text_blocks_and_surfaces_tool_use() {
		let body = json!({
			"id": "msg_1",
			"model": "claude-3",
			"stop_reason": "end_turn",
			"content": [
				{"type": "text", "text": "hello "},
				{"type": "thinking", "thinking": "ignored"},
				{"type": "text", "text": "world"},
				{"type": "tool_use", "id": "t1", "name": "lookup", "input": {"q": "x"}},
			],
			"usage": {"input_tokens": 5, "output_tokens": 2},
		});
		let resp = AnthropicAdapter.parse_response(&serde_json::to_vec(&body).unwrap(), "claude-3").unwrap();
		assert_eq!(resp.choices[0].message.text(), "hello world");
		assert!(resp.choices[0].message.tool_calls.is_some());
		assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
	}

	#[test]
	fn openai_client_system_message_merges_into_top_level_system() {
		let req = Request::from_body(
			strng::literal("r1"),
			json!({
				"model": "claude-3",
				"messages": [
					{"role": "system", "content": "be nice"},
					{"role": "user", "content": "hi"},
				]
			}),
			ClientProtocol::OpenAI,
			vec![],
		)
		.unwrap();
		let built = AnthropicAdapter.build_request(&req, &backend(), "claude-3-opus").unwrap();
		let body: Value = serde_json::from_slice(&built.body).unwrap();
		assert_eq!(body["system"], json!("be nice"));
		assert_eq!(body["messages"].as_array().unwrap().len(), 1);
	}

	#[test]
	fn message_stop_is_terminal() {
		assert!(AnthropicAdapter.is_stream_terminal(br#"{"type":"message_stop"}"#));
		assert!(!AnthropicAdapter.is_stream_terminal(br#"{"type":"content_block_delta"}"#));
	}

	#[test]
	fn lifts_reasoning_content_for_assistant_tool_call_turn_when_thinking_enabled() {
		let req = Request::from_body(
			strng::literal("r1"),
			json!({
				"model": "claude-3",
				"thinking": {"type": "enabled", "budget_tokens": 1024},
				"messages": [
					{"role": "user", "content": "what's the weather?"},
					{
						"role": "assistant",
						"content": "checking",
						"tool_calls": [{"id": "t1", "type": "function", "function": {"name": "weather", "arguments": "{}"}}],
						"additional_kwargs": {"reasoning_content": "I should call the weather tool"},
					},
				]
			}),
			ClientProtocol::OpenAI,
			vec![],
		)
		.unwrap();
		let built = AnthropicAdapter.build_request(&req, &backend(), "claude-3-opus").unwrap();
		let body: Value = serde_json::from_slice(&built.body).unwrap();
		let turn = &body["messages"][1];
		assert_eq!(turn["role"], json!("assistant"));
		assert_eq!(turn["reasoning_content"], json!("I should call the weather tool"));
	}

	#[test]
	fn omits_reasoning_content_when_thinking_not_enabled() {
		let req = Request::from_body(
			strng::literal("r1"),
			json!({
				"model": "claude-3",
				"messages": [
					{"role": "user", "content": "hi"},
					{
						"role": "assistant",
						"content": "ok",
						"tool_calls": [{"id": "t1", "type": "function", "function": {"name": "f", "arguments": "{}"}}],
						"additional_kwargs": {"reasoning_content": "trace"},
					},
				]
			}),
			ClientProtocol::OpenAI,
			vec![],
		)
		.unwrap();
		let built = AnthropicAdapter.build_request(&req, &backend(), "claude-3-opus").unwrap();
		let body: Value = serde_json::from_slice(&built.body).unwrap();
		assert!(body["messages"][1].get("reasoning_content").is_none());
	}
}
