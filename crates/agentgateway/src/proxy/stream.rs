//! Streaming Pipeline: SSE/JSON-Lines framing, translating
//! vs pass-through forwarding, flush-per-chunk, and cancellation. Built as
//! an `axum::body::Body` so the handler can hand it straight back from the
//! `POST /v1/chat/completions` / `POST /v1/messages` routes.

use std::convert::Infallible;

use agent_core::prelude::*;
use async_stream::stream;
use axum::body::Body;
use axum::response::{IntoResponse, Response as AxumResponse};
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use crate::health::{CircuitConfig, InFlightGuard};
use crate::llm::Adapter;
use crate::telemetry::BodyLogSink;
use crate::types::request::ClientProtocol;
use crate::types::stream::StreamChunk;

/// Pulls raw byte chunks off the upstream body, honouring cancellation.
/// Used directly by pass-through mode and as the low-level reader that
/// translating mode layers frame-splitting on top of.
async fn next_upstream_chunk(body: &mut hyper::body::Incoming, cancellation: &CancellationToken) -> Option<Bytes> {
	loop {
		tokio::select! {
			biased;
			_ = cancellation.cancelled() => return None,
			frame = body.frame() => {
				match frame {
					Some(Ok(f)) => {
						if let Ok(data) = f.into_data() {
							if !data.is_empty() {
								return Some(data);
							}
							continue;
						}
						continue;
					},
					Some(Err(_)) => return None,
					None => return None,
				}
			}
		}
	}
}

/// Splits a byte stream on blank-line-terminated SSE records, returning
/// each record's `data:` payload (used by translating mode, and by
/// pass-through solely to notice the terminal frame for logging — the
/// bytes it writes to the client are the untouched raw chunks, not these
/// reconstructed payloads).
struct SseFrames {
	buf: Vec<u8>,
}

impl SseFrames {
	fn new() -> Self {
		Self { buf: Vec::new() }
	}

	fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
		self.buf.extend_from_slice(chunk);
		let mut out = Vec::new();
		while let Some(pos) = find_double_newline(&self.buf) {
			let record = self.buf.drain(..pos).collect::<Vec<u8>>();
			// drain the blank-line separator itself
			let sep_len = if self.buf.starts_with(b"\r\n\r\n") { 4 } else { 2 };
			self.buf.drain(..sep_len.min(self.buf.len()));
			if let Some(payload) = extract_data_payload(&record) {
				out.push(Bytes::from(payload));
			}
		}
		out
	}
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
	buf.windows(2).position(|w| w == b"\n\n").or_else(|| buf.windows(4).position(|w| w == b"\r\n\r\n"))
}

fn extract_data_payload(record: &[u8]) -> Option<Vec<u8>> {
	let text = std::str::from_utf8(record).ok()?;
	for line in text.lines() {
		if let Some(rest) = line.strip_prefix("data: ") {
			return Some(rest.as_bytes().to_vec());
		}
		if let Some(rest) = line.strip_prefix("data:") {
			return Some(rest.as_bytes().to_vec());
		}
	}
	None
}

/// Vertex's JSON-Lines framing: one JSON object per `\n`-terminated line.
struct JsonLinesFrames {
	buf: Vec<u8>,
}

impl JsonLinesFrames {
	fn new() -> Self {
		Self { buf: Vec::new() }
	}

	fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
		self.buf.extend_from_slice(chunk);
		let mut out = Vec::new();
		while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
			let line: Vec<u8> = self.buf.drain(..=pos).collect();
			let text = String::from_utf8_lossy(&line);
			// Vertex's REST streaming endpoint wraps records in a top-level JSON
			// array; strip the array/comma punctuation so each line is bare JSON.
			let s = text.trim().trim_start_matches('[').trim_end_matches(',').trim_end_matches(']').trim();
			if !s.is_empty() {
				out.push(Bytes::copy_from_slice(s.as_bytes()));
			}
		}
		out
	}
}

fn sse_event_for(client_protocol: ClientProtocol, chunk: &StreamChunk) -> Bytes {
	match (client_protocol, chunk) {
		(ClientProtocol::OpenAI, StreamChunk::Delta { content, role }) => {
			let delta = if let Some(role) = role {
				serde_json::json!({"role": role.as_str(), "content": content.as_str()})
			} else {
				serde_json::json!({"content": content.as_str()})
			};
			let payload = serde_json::json!({"choices": [{"index": 0, "delta": delta, "finish_reason": null}]});
			Bytes::from(format!("data: {payload}\n\n"))
		},
		(ClientProtocol::OpenAI, StreamChunk::ToolCallDelta { raw }) => {
			let payload = serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": raw}, "finish_reason": null}]});
			Bytes::from(format!("data: {payload}\n\n"))
		},
		(ClientProtocol::OpenAI, StreamChunk::Terminal { finish_reason }) => {
			let payload = serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason.as_ref().map(|s| s.as_str())}]});
			Bytes::from(format!("data: {payload}\n\ndata: [DONE]\n\n"))
		},
		(ClientProtocol::OpenAI, StreamChunk::Error { message }) => Bytes::from(format!(
			"data: {}\n\n",
			serde_json::json!({"error": {"message": message.as_str()}})
		)),
		(ClientProtocol::Anthropic, StreamChunk::Delta { content, .. }) => {
			let payload = serde_json::json!({
				"type": "content_block_delta",
				"index": 0,
				"delta": {"type": "text_delta", "text": content.as_str()},
			});
			Bytes::from(format!("event: content_block_delta\ndata: {payload}\n\n"))
		},
		(ClientProtocol::Anthropic, StreamChunk::ToolCallDelta { raw }) => {
			let payload = serde_json::json!({"type": "content_block_delta", "index": 0, "delta": raw});
			Bytes::from(format!("event: content_block_delta\ndata: {payload}\n\n"))
		},
		(ClientProtocol::Anthropic, StreamChunk::Terminal { finish_reason }) => {
			let delta_payload = serde_json::json!({"type": "message_delta", "delta": {"stop_reason": finish_reason.as_ref().map(|s| s.as_str())}});
			let stop_payload = serde_json::json!({"type": "message_stop"});
			Bytes::from(format!("event: message_delta\ndata: {delta_payload}\n\nevent: message_stop\ndata: {stop_payload}\n\n"))
		},
		(ClientProtocol::Anthropic, StreamChunk::Error { message }) => Bytes::from(format!(
			"event: error\ndata: {}\n\n",
			serde_json::json!({"type": "error", "error": {"message": message.as_str()}})
		)),
	}
}

/// Anthropic's typed SSE framing wraps the first delta in `message_start` +
/// `content_block_start` and the last in `content_block_stop` ahead of the
/// `message_delta`/`message_stop` pair `sse_event_for` already emits
/// — only needed in translating mode, since pass-through
/// mirrors whatever preamble the Anthropic backend itself already sent.
fn anthropic_message_start() -> Bytes {
	let payload = serde_json::json!({
		"type": "message_start",
		"message": {"id": "", "type": "message", "role": "assistant", "content": [], "model": ""},
	});
	Bytes::from(format!(
		"event: message_start\ndata: {payload}\n\nevent: content_block_start\ndata: {}\n\n",
		serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})
	))
}

fn anthropic_content_block_stop() -> Bytes {
	Bytes::from(format!("event: content_block_stop\ndata: {}\n\n", serde_json::json!({"type": "content_block_stop", "index": 0})))
}

pub const STREAM_RESPONSE_HEADERS: &[(&str, &str)] = &[
	("cache-control", "no-cache"),
	("connection", "keep-alive"),
	("x-accel-buffering", "no"),
];

/// Build the streaming HTTP response. `same_dialect` selects pass-through
/// (verbatim byte mirroring) vs translating mode.
///
/// `guard` is the in-flight slot (and HalfOpen single-trial gate, if this
/// backend was on trial) acquired back in the executor at commit time. It is
/// moved into the response body's generator and only released — together
/// with recording the circuit-breaker success — once the stream actually
/// finishes, however it finishes: terminal frame, upstream EOF, cancellation,
/// or deadline. If the body is dropped early (client disconnect), the guard
/// still drops with it.
pub fn build_response(
	mut upstream: hyper::body::Incoming,
	adapter: &'static dyn Adapter,
	client_protocol: ClientProtocol,
	same_dialect: bool,
	req_id: Strng,
	backend_name: Strng,
	cancellation: CancellationToken,
	deadline: std::time::Duration,
	body_log: std::sync::Arc<dyn BodyLogSink>,
	guard: InFlightGuard,
	circuit: CircuitConfig,
) -> AxumResponse {
	let body_stream = stream! {
		let guard = guard;
		let deadline_fut = tokio::time::sleep(deadline);
		tokio::pin!(deadline_fut);
		let mut sse = SseFrames::new();
		let mut jsonl = JsonLinesFrames::new();
		let is_vertex = adapter.protocol() == crate::types::backend::Protocol::Vertex;
		let anthropic_framing = !same_dialect && client_protocol == ClientProtocol::Anthropic;
		let mut started = false;

		loop {
			tokio::select! {
				biased;
				_ = cancellation.cancelled() => break,
				_ = &mut deadline_fut => break,
				chunk = next_upstream_chunk(&mut upstream, &cancellation) => {
					let Some(chunk) = chunk else { break };
					body_log.record(&req_id, &backend_name, &chunk);

					if same_dialect {
						yield Ok::<Bytes, Infallible>(chunk);
						continue;
					}

					let frames = if is_vertex { jsonl.push(&chunk) } else { sse.push(&chunk) };
					for frame in frames {
						if let Some(parsed) = adapter.parse_stream_chunk(&frame) {
							if anthropic_framing && !started {
								yield Ok(anthropic_message_start());
								started = true;
							}
							let terminal = parsed.is_terminal();
							if anthropic_framing && terminal {
								yield Ok(anthropic_content_block_stop());
							}
							yield Ok(sse_event_for(client_protocol, &parsed));
							if terminal {
								guard.record_success(&circuit);
								return;
							}
						}
					}
				}
			}
		}

		if !same_dialect {
			// Upstream EOF without an explicit terminal frame: still close
			// the client's stream out per dialect.
			if anthropic_framing {
				if !started {
					yield Ok(anthropic_message_start());
				}
				yield Ok(anthropic_content_block_stop());
			}
			yield Ok(sse_event_for(client_protocol, &StreamChunk::Terminal { finish_reason: None }));
		}
		guard.record_success(&circuit);
	};

	let mut response = AxumResponse::new(Body::from_stream(body_stream));
	*response.status_mut() = http::StatusCode::OK;
	let headers = response.headers_mut();
	headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("text/event-stream"));
	for (name, value) in STREAM_RESPONSE_HEADERS {
		if let (Ok(name), Ok(value)) = (http::HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(value)) {
			headers.insert(name, value);
		}
	}
	response.into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sse_frames_splits_on_blank_line() {
		let mut f = SseFrames::new();
		let out = f.push(b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\n");
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].as_ref(), b"{\"a\":1}");
	}

	#[test]
	fn sse_frames_handles_split_across_chunks() {
		let mut f = SseFrames::new();
		let a = f.push(b"data: {\"a\":1}\n");
		assert!(a.is_empty());
		let b = f.push(b"\n");
		assert_eq!(b.len(), 1);
	}

	#[test]
	fn json_lines_frames_splits_on_newline() {
		let mut f = JsonLinesFrames::new();
		let out = f.push(b"{\"a\":1}\n{\"a\":2}\n");
		assert_eq!(out.len(), 2);
	}

	#[test]
	fn openai_terminal_appends_done_sentinel() {
		let bytes = sse_event_for(ClientProtocol::OpenAI, &StreamChunk::Terminal { finish_reason: Some(strng::literal("stop")) });
		let s = std::str::from_utf8(&bytes).unwrap();
		assert!(s.ends_with("data: [DONE]\n\n"));
	}

	#[test]
	fn anthropic_terminal_emits_message_stop_event() {
		let bytes = sse_event_for(ClientProtocol::Anthropic, &StreamChunk::Terminal { finish_reason: None });
		let s = std::str::from_utf8(&bytes).unwrap();
		assert!(s.contains("event: message_stop"));
	}

	#[test]
	fn anthropic_preamble_opens_message_and_content_block() {
		let s = std::str::from_utf8(&anthropic_message_start()).unwrap().to_string();
		assert!(s.contains("event: message_start"));
		assert!(s.contains("event: content_block_start"));
	}
}
