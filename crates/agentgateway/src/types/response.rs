use agent_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::Message;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub prompt_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completion_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub total_tokens: Option<u64>,
}

impl Usage {
	/// Fill `total_tokens` from the other two fields when upstream omitted it.
	pub fn normalize(mut self) -> Self {
		if self.total_tokens.is_none() {
			if let (Some(p), Some(c)) = (self.prompt_tokens, self.completion_tokens) {
				self.total_tokens = Some(p + c);
			}
		}
		self
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: Message,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<Strng>,
}

/// Canonical response produced by an adapter's `parse_response`. `choices`
/// and `usage` may be legitimately empty: an upstream that
/// warns but still returns a shape we can parse is still a valid `Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: Strng,
	pub model: Strng,
	#[serde(default)]
	pub choices: Vec<Choice>,
	#[serde(default)]
	pub usage: Usage,
	/// Upstream headers preserved after hop-by-hop filtering.
	#[serde(skip)]
	pub headers: Vec<(Strng, Strng)>,
	/// Residual fields from the upstream body not represented above,
	/// re-merged on serialization so unknown keys survive.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}

impl Response {
	pub fn empty(id: impl Into<Strng>, model: impl Into<Strng>) -> Self {
		Self {
			id: id.into(),
			model: model.into(),
			choices: Vec::new(),
			usage: Usage::default(),
			headers: Vec::new(),
			extra: serde_json::Map::new(),
		}
	}
}
