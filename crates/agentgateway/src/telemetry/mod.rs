//! Ambient observability stack: `tracing` init and the body-log sink
//!. One span per request carrying
//! `req_id`; attempt-level events carry `backend`, `attempt`, `outcome`,
//! `latency_ms`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global `tracing` subscriber: env-filter plus JSON
/// formatting on stderr, matching how the rest of this lineage logs.
pub fn init() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr).with_ansi(false);
	let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
}

/// Append-only sink for full upstream/request bodies:
/// error messages surfaced to clients are truncated, but the full text
/// still lands here for offline debugging. Concurrency-safe, no
/// back-pressure on the request path — drops are acceptable but counted.
pub trait BodyLogSink: Send + Sync {
	fn record(&self, req_id: &str, label: &str, body: &[u8]);
	fn dropped(&self) -> u64;
}

pub struct BodyLogEntry {
	pub req_id: String,
	pub label: String,
	pub body: Vec<u8>,
}

/// Default implementation: a fixed-capacity in-memory ring buffer. Once
/// full, the oldest entry is evicted to make room and the eviction is
/// counted via `dropped()` rather than silently discarded.
pub struct RingBufferSink {
	capacity: usize,
	entries: Mutex<VecDeque<BodyLogEntry>>,
	dropped: AtomicU64,
}

impl RingBufferSink {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: Mutex::new(VecDeque::with_capacity(capacity)),
			dropped: AtomicU64::new(0),
		}
	}

	pub fn snapshot(&self) -> Vec<String> {
		self.entries.lock().unwrap().iter().map(|e| format!("{}/{}", e.req_id, e.label)).collect()
	}
}

impl Default for RingBufferSink {
	fn default() -> Self {
		Self::new(1024)
	}
}

impl BodyLogSink for RingBufferSink {
	fn record(&self, req_id: &str, label: &str, body: &[u8]) {
		let mut entries = self.entries.lock().unwrap();
		if entries.len() >= self.capacity {
			entries.pop_front();
			self.dropped.fetch_add(1, Ordering::Relaxed);
		}
		entries.push_back(BodyLogEntry {
			req_id: req_id.to_string(),
			label: label.to_string(),
			body: body.to_vec(),
		});
	}

	fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evicts_oldest_and_counts_drops_once_full() {
		let sink = RingBufferSink::new(2);
		sink.record("r1", "upstream", b"a");
		sink.record("r2", "upstream", b"b");
		sink.record("r3", "upstream", b"c");
		assert_eq!(sink.dropped(), 1);
		assert_eq!(sink.snapshot(), vec!["r2/upstream".to_string(), "r3/upstream".to_string()]);
	}
}
