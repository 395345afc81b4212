//! Configuration loading and atomic hot-reload. The request lifecycle must
//! tolerate atomic snapshot replacement between requests — this module is
//! the thing that does the replacing, via `arc_swap::ArcSwap` published
//! from a `notify` file watcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_core::prelude::*;
use arc_swap::ArcSwap;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use serde::Deserialize;

use crate::types::backend::{Backend, Protocol};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRoute {
	pub backend: String,
	pub model: String,
	#[serde(default)]
	pub priority: u32,
	#[serde(default = "default_weight")]
	pub weight: u32,
}

fn default_weight() -> u32 {
	1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAlias {
	pub name: String,
	pub routes: Vec<RawRoute>,
	#[serde(default)]
	pub fallback_aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCircuit {
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,
	#[serde(default = "default_success_threshold")]
	pub success_threshold: u32,
	#[serde(default = "default_open_timeout")]
	pub open_timeout: String,
	#[serde(default = "default_cooldown")]
	pub cooldown: String,
}

fn default_failure_threshold() -> u32 {
	5
}
fn default_success_threshold() -> u32 {
	2
}
fn default_open_timeout() -> String {
	"30s".to_string()
}
fn default_cooldown() -> String {
	"10s".to_string()
}

impl Default for RawCircuit {
	fn default() -> Self {
		Self {
			failure_threshold: default_failure_threshold(),
			success_threshold: default_success_threshold(),
			open_timeout: default_open_timeout(),
			cooldown: default_cooldown(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRetry {
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_backoff_base")]
	pub backoff_base: String,
	#[serde(default = "default_backoff_multiplier")]
	pub backoff_multiplier: f64,
	#[serde(default = "default_backoff_max_delay")]
	pub backoff_max_delay: String,
	#[serde(default = "default_backoff_jitter")]
	pub backoff_jitter: f64,
	#[serde(default = "default_attempt_timeout")]
	pub attempt_timeout: String,
}

fn default_max_retries() -> u32 {
	2
}
fn default_backoff_base() -> String {
	"200ms".to_string()
}
fn default_backoff_multiplier() -> f64 {
	2.0
}
fn default_backoff_max_delay() -> String {
	"5s".to_string()
}
fn default_backoff_jitter() -> f64 {
	0.2
}
fn default_attempt_timeout() -> String {
	"30s".to_string()
}

impl Default for RawRetry {
	fn default() -> Self {
		Self {
			max_retries: default_max_retries(),
			backoff_base: default_backoff_base(),
			backoff_multiplier: default_backoff_multiplier(),
			backoff_max_delay: default_backoff_max_delay(),
			backoff_jitter: default_backoff_jitter(),
			attempt_timeout: default_attempt_timeout(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
	#[serde(default)]
	pub listen_addr: Option<String>,
	/// Shared proxy key; when absent, auth is not enforced.
	#[serde(default)]
	pub proxy_key: Option<String>,
	pub backends: Vec<Backend>,
	pub aliases: Vec<RawAlias>,
	#[serde(default)]
	pub circuit: RawCircuit,
	#[serde(default)]
	pub retry: RawRetry,
	#[serde(default)]
	pub in_flight_limit: Option<u32>,
	#[serde(default = "default_streaming_deadline")]
	pub streaming_deadline: String,
}

fn default_streaming_deadline() -> String {
	"15m".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("reading config file {0}: {1}")]
	Io(PathBuf, std::io::Error),
	#[error("parsing config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
	#[error("invalid duration {0:?}: {1}")]
	Duration(String, String),
}

#[derive(Debug, Clone)]
pub struct Route {
	pub backend: Strng,
	pub backend_model: Strng,
	pub priority: u32,
	pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct ModelAlias {
	pub name: Strng,
	pub routes: Vec<Route>,
	pub fallback_aliases: Vec<Strng>,
}

/// Validated, immutable configuration snapshot. Routers hold an `Arc<Config>`
/// exclusively; a reload swaps the `Arc` atomically in `ConfigHandle`.
#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: String,
	pub proxy_key: Option<Strng>,
	pub backends: HashMap<Strng, Arc<Backend>>,
	pub aliases: HashMap<Strng, ModelAlias>,
	pub circuit: crate::health::CircuitConfig,
	pub max_retries: u32,
	pub backoff_base: Duration,
	pub backoff_multiplier: f64,
	pub backoff_max_delay: Duration,
	pub backoff_jitter: f64,
	pub attempt_timeout: Duration,
	pub in_flight_limit: Option<u32>,
	pub streaming_deadline: Duration,
}

fn parse_duration(field: &str, s: &str) -> Result<Duration, ConfigError> {
	go_parse_duration::parse_duration(s)
		.map(|nanos| Duration::from_nanos(nanos.max(0) as u64))
		.map_err(|e| ConfigError::Duration(field.to_string(), format!("{e:?}")))
}

impl Config {
	pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
		let mut backends = HashMap::new();
		for b in raw.backends {
			b.validate().map_err(ConfigError::Invalid)?;
			backends.insert(b.name.clone(), Arc::new(b));
		}

		let mut aliases = HashMap::new();
		for a in raw.aliases {
			let routes = a
				.routes
				.into_iter()
				.map(|r| Route {
					backend: strng::new(r.backend),
					backend_model: strng::new(r.model),
					priority: r.priority,
					weight: r.weight,
				})
				.collect();
			aliases.insert(
				strng::new(&a.name),
				ModelAlias {
					name: strng::new(a.name),
					routes,
					fallback_aliases: a.fallback_aliases.into_iter().map(strng::new).collect(),
				},
			);
		}

		let circuit = crate::health::CircuitConfig {
			failure_threshold: raw.circuit.failure_threshold,
			success_threshold: raw.circuit.success_threshold,
			open_timeout: parse_duration("circuit.openTimeout", &raw.circuit.open_timeout)?,
			cooldown: parse_duration("circuit.cooldown", &raw.circuit.cooldown)?,
		};

		Ok(Self {
			listen_addr: raw.listen_addr.unwrap_or_else(|| "0.0.0.0:8080".to_string()),
			proxy_key: raw.proxy_key.map(strng::new),
			backends,
			aliases,
			circuit,
			max_retries: raw.retry.max_retries,
			backoff_base: parse_duration("retry.backoffBase", &raw.retry.backoff_base)?,
			backoff_multiplier: raw.retry.backoff_multiplier,
			backoff_max_delay: parse_duration("retry.backoffMaxDelay", &raw.retry.backoff_max_delay)?,
			backoff_jitter: raw.retry.backoff_jitter,
			attempt_timeout: parse_duration("retry.attemptTimeout", &raw.retry.attempt_timeout)?,
			in_flight_limit: raw.in_flight_limit,
			streaming_deadline: parse_duration("streamingDeadline", &raw.streaming_deadline)?,
		})
	}

	pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
		let raw: RawConfig = serde_yaml::from_str(s)?;
		Self::from_raw(raw)
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
		Self::from_yaml_str(&s)
	}
}

/// Owns the live `Arc<Config>` and (optionally) a background file watcher
/// that republishes a new snapshot on every debounced filesystem event.
pub struct ConfigHandle {
	snapshot: Arc<ArcSwap<Config>>,
	_watcher: Option<notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::RecommendedCache>>,
}

impl ConfigHandle {
	pub fn static_config(config: Config) -> Self {
		Self {
			snapshot: Arc::new(ArcSwap::from_pointee(config)),
			_watcher: None,
		}
	}

	/// Load from `path` and watch it for changes; on a write/modify event the
	/// file is re-parsed and, if valid, atomically swapped in. Invalid
	/// reloads are logged and the previous snapshot is kept live.
	pub fn watching(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref().to_path_buf();
		let initial = Config::from_file(&path)?;
		let snapshot = Arc::new(ArcSwap::from_pointee(initial));

		let watch_snapshot = snapshot.clone();
		let watch_path = path.clone();
		let mut debouncer = new_debouncer(
			Duration::from_millis(300),
			None,
			move |result: DebounceEventResult| {
				if result.is_err() {
					return;
				}
				match Config::from_file(&watch_path) {
					Ok(cfg) => {
						tracing::info!(path = %watch_path.display(), "config reloaded");
						watch_snapshot.store(Arc::new(cfg));
					},
					Err(err) => {
						tracing::warn!(path = %watch_path.display(), error = %err, "config reload failed, keeping previous snapshot");
					},
				}
			},
		)
		.map_err(|e| ConfigError::Invalid(e.to_string()))?;
		debouncer
			.watch(&path, notify::RecursiveMode::NonRecursive)
			.map_err(|e| ConfigError::Invalid(e.to_string()))?;

		Ok(Self {
			snapshot,
			_watcher: Some(debouncer),
		})
	}

	pub fn current(&self) -> Arc<Config> {
		self.snapshot.load_full()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
proxyKey: secret-key
backends:
  - name: b1
    baseUrl: https://api.openai.com
    apiKey: sk-test
    protocol: open-ai
  - name: b2
    baseUrl: https://api.anthropic.com
    apiKey: sk-ant-test
    protocol: anthropic
aliases:
  - name: gpt-4
    routes:
      - backend: b1
        model: gpt-4o
"#;

	#[test]
	fn parses_sample_config() {
		let cfg = Config::from_yaml_str(SAMPLE).expect("parses");
		assert_eq!(cfg.backends.len(), 2);
		assert!(cfg.aliases.contains_key("gpt-4"));
		assert_eq!(cfg.proxy_key.as_deref(), Some("secret-key"));
	}

	#[test]
	fn rejects_bad_url() {
		let bad = SAMPLE.replace("https://api.openai.com", "not-a-url");
		assert!(Config::from_yaml_str(&bad).is_err());
	}

	#[test]
	fn loads_and_reloads_from_a_real_file() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("config.yaml");
		std::fs::write(&path, SAMPLE).expect("write");

		let handle = ConfigHandle::watching(&path).expect("load");
		assert_eq!(handle.current().backends.len(), 2);

		let updated = SAMPLE.replace("gpt-4o", "gpt-4o-mini");
		std::fs::write(&path, updated).expect("rewrite");

		// The debouncer swaps the snapshot asynchronously on a background
		// thread; poll briefly rather than assume a fixed single sleep wins
		// the race against its 300ms debounce window.
		let mut reloaded = false;
		for _ in 0..50 {
			if handle.current().aliases["gpt-4"].routes[0].backend_model == "gpt-4o-mini" {
				reloaded = true;
				break;
			}
			std::thread::sleep(Duration::from_millis(50));
		}
		assert!(reloaded, "expected config to hot-reload within the poll window");
	}
}
