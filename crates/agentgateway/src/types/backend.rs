use agent_core::prelude::*;
use serde::{Deserialize, Serialize};

/// Closed enumeration of wire dialects a `Backend` may speak.
/// Azure/DeepSeek/Groq/Mistral/Cohere are distinct tags
/// so config and health metrics can name them, but they all dispatch
/// through the OpenAI-compatible adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
	OpenAI,
	Azure,
	DeepSeek,
	Groq,
	Mistral,
	Cohere,
	Anthropic,
	Vertex,
}

impl Protocol {
	pub fn is_openai_compatible(self) -> bool {
		matches!(
			self,
			Protocol::OpenAI | Protocol::Azure | Protocol::DeepSeek | Protocol::Groq | Protocol::Mistral | Protocol::Cohere
		)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Protocol::OpenAI => "openai",
			Protocol::Azure => "azure",
			Protocol::DeepSeek => "deepseek",
			Protocol::Groq => "groq",
			Protocol::Mistral => "mistral",
			Protocol::Cohere => "cohere",
			Protocol::Anthropic => "anthropic",
			Protocol::Vertex => "vertex",
		}
	}
}

/// Immutable configuration record for one upstream provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
	pub name: Strng,
	pub base_url: Strng,
	pub api_key: secrecy::SecretString,
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub protocol: Protocol,
	#[serde(default)]
	pub locale: Option<Strng>,
	#[serde(default)]
	pub weight: Option<u32>,
	#[serde(default)]
	pub priority: Option<u32>,
	#[serde(default)]
	pub connect_timeout_ms: Option<u64>,
	#[serde(default)]
	pub request_timeout_ms: Option<u64>,
	/// Azure-style deployment-scoped API override; unused by other protocols.
	#[serde(default)]
	pub api_version: Option<Strng>,
	/// Vertex-only: GCP project and region used to compose the
	/// `/v1/projects/{project}/locations/{region}/...` path.
	#[serde(default)]
	pub project_id: Option<Strng>,
	#[serde(default)]
	pub region: Option<Strng>,
}

fn default_true() -> bool {
	true
}

impl Backend {
	pub fn validate(&self) -> Result<(), String> {
		let url = url::Url::parse(&self.base_url).map_err(|e| format!("backend {}: invalid base_url: {e}", self.name))?;
		if url.host_str().is_none() {
			return Err(format!("backend {}: base_url missing host", self.name));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
	Primary,
	Fallback,
}

/// One resolved routing candidate: a backend plus the backend-side model
/// name to send, and the ordering keys used to produce it.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
	pub backend: std::sync::Arc<Backend>,
	pub backend_model: Strng,
	pub priority: u32,
	pub weight: u32,
	pub kind: RouteKind,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn openai_family_dispatches_compat() {
		assert!(Protocol::Azure.is_openai_compatible());
		assert!(Protocol::Groq.is_openai_compatible());
		assert!(!Protocol::Anthropic.is_openai_compatible());
		assert!(!Protocol::Vertex.is_openai_compatible());
	}

	#[test]
	fn validate_rejects_missing_host() {
		let b = Backend {
			name: strng::literal("b1"),
			base_url: strng::literal("not-a-url"),
			api_key: secrecy::SecretString::from("k".to_string()),
			enabled: true,
			protocol: Protocol::OpenAI,
			locale: None,
			weight: None,
			priority: None,
			connect_timeout_ms: None,
			request_timeout_ms: None,
			api_version: None,
			project_id: None,
			region: None,
		};
		assert!(b.validate().is_err());
	}
}
