use agent_core::prelude::*;

/// One frame of a translated stream. A stream is a finite lazy sequence
/// terminating on the first `Terminal` chunk or on transport EOF
///.
#[derive(Debug, Clone)]
pub enum StreamChunk {
	Delta { content: Strng, role: Option<Strng> },
	ToolCallDelta { raw: serde_json::Value },
	Terminal { finish_reason: Option<Strng> },
	Error { message: Strng },
}

impl StreamChunk {
	pub fn is_terminal(&self) -> bool {
		matches!(self, StreamChunk::Terminal { .. })
	}
}
