//! Protocol adapter layer: per-dialect conversion of request, response,
//! stream chunk and error. Each adapter is a pure function
//! set over bytes and the canonical entities in `crate::types`.

pub mod anthropic;
pub mod openai;
pub mod vertex;

use agent_core::prelude::*;
use bytes::Bytes;

use crate::error::Error;
use crate::types::backend::{Backend, Protocol};
use crate::types::{Request, Response, StreamChunk};

/// One HTTP request shaped for a specific backend dialect.
pub struct BuiltRequest {
	pub path: Strng,
	pub headers: Vec<(Strng, Strng)>,
	pub body: Bytes,
}

/// The capability set every dialect implementation provides: BuildRequest,
/// ParseResponse, ParseStreamChunk, ConvertError, Supports, Protocol, Name.
pub trait Adapter: Send + Sync {
	fn protocol(&self) -> Protocol;

	fn name(&self) -> &'static str;

	/// Whether this adapter implementation should be used for `p`. The
	/// OpenAI-compatible adapter returns true for its whole family.
	fn supports(&self, p: Protocol) -> bool {
		p == self.protocol()
	}

	/// Build the backend body from the client's raw JSON, preserving unknown
	/// fields, and any dialect-specific header/path adjustments.
	fn build_request(&self, req: &Request, backend: &Backend, backend_model: &str) -> Result<BuiltRequest, Error>;

	/// Parse a non-streaming backend response. Adapters never raise on parse
	/// failure: return `None` and the executor treats it as a
	/// soft failure and advances to the next candidate.
	fn parse_response(&self, body: &[u8], requested_model: &str) -> Option<Response>;

	/// Parse one upstream stream frame (an SSE `data:` payload for
	/// OpenAI/Anthropic, one JSON-Lines record for Vertex).
	fn parse_stream_chunk(&self, frame: &[u8]) -> Option<StreamChunk>;

	/// True when `frame` is this dialect's terminal marker (`[DONE]`,
	/// `message_stop`, presence of `usageMetadata`, ...).
	fn is_stream_terminal(&self, frame: &[u8]) -> bool;

	fn convert_error(&self, status: u16, body: &[u8]) -> Error;
}

/// Holds one boxed adapter per distinct implementation and dispatches by
/// exact protocol match first, falling back to the OpenAI-compatible
/// adapter for any tag it declares support for.
pub struct Registry {
	adapters: Vec<Box<dyn Adapter>>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	pub fn new() -> Self {
		Self {
			adapters: vec![
				Box::new(openai::OpenAIAdapter),
				Box::new(anthropic::AnthropicAdapter),
				Box::new(vertex::VertexAdapter),
			],
		}
	}

	pub fn get(&self, protocol: Protocol) -> &dyn Adapter {
		self
			.adapters
			.iter()
			.find(|a| a.protocol() == protocol)
			.or_else(|| self.adapters.iter().find(|a| a.supports(protocol)))
			.map(|b| b.as_ref())
			.expect("registry covers every Protocol variant")
	}
}

/// Hop-by-hop headers dropped in both directions.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
	HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registry_dispatches_openai_family_to_compat_adapter() {
		let reg = Registry::new();
		let azure = reg.get(Protocol::Azure);
		assert_eq!(azure.name(), "openai");
		let groq = reg.get(Protocol::Groq);
		assert_eq!(groq.name(), "openai");
	}

	#[test]
	fn registry_dispatches_exact_matches() {
		let reg = Registry::new();
		assert_eq!(reg.get(Protocol::Anthropic).name(), "anthropic");
		assert_eq!(reg.get(Protocol::Vertex).name(), "vertex");
	}

	#[test]
	fn hop_by_hop_is_case_insensitive() {
		assert!(is_hop_by_hop("Transfer-Encoding"));
		assert!(!is_hop_by_hop("Content-Type"));
	}
}
