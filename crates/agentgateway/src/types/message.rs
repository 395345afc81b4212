use agent_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A chat message as carried by the canonical `Request`/`Response`. `role`
/// is deliberately a free-form string: callers and backends
/// invent roles we don't want to reject on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Strng,
	/// String, structured multimodal array, or null — kept as raw JSON so
	/// unrecognized shapes round-trip untouched.
	pub content: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<Strng>,
	/// Anthropic-style `cache_control` annotation, preserved opaquely.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cache_control: Option<Value>,
	/// Any per-message key this type doesn't recognize (e.g. OpenAI's `name`
	/// field on function/tool messages), merged back in verbatim on
	/// serialize so pass-through mode never drops them.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Message {
	pub fn system(text: impl Into<Strng>) -> Self {
		Self {
			role: strng::literal("system"),
			content: Value::String(text.into().to_string()),
			tool_calls: None,
			tool_call_id: None,
			cache_control: None,
			extra: Map::new(),
		}
	}

	/// Concatenate the text portions of `content`, whether it's a plain
	/// string or a structured content-block array. Non-text blocks are
	/// ignored for this helper.
	pub fn text(&self) -> String {
		match &self.content {
			Value::String(s) => s.clone(),
			Value::Array(parts) => parts
				.iter()
				.filter_map(|p| p.get("text").and_then(Value::as_str))
				.collect::<Vec<_>>()
				.join(""),
			_ => String::new(),
		}
	}

	pub fn is_role(&self, role: &str) -> bool {
		self.role.eq_ignore_ascii_case(role)
	}
}
