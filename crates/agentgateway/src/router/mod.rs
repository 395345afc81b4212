//! Pure resolver: `(model alias, config snapshot, health registry) ->
//! ordered [RouteCandidate]`. No I/O.

use std::collections::HashSet;
use std::sync::Arc;

use agent_core::prelude::*;

use crate::config::Config;
use crate::error::Error;
use crate::health::HealthRegistry;
use crate::types::backend::{Backend, RouteCandidate, RouteKind};

/// Recursion depth for alias-fallback expansion is bounded to 1 level
///.
const MAX_FALLBACK_ALIAS_DEPTH: u32 = 1;

pub struct Router<'a> {
	config: &'a Config,
	health: &'a HealthRegistry,
}

struct ScoredRoute {
	backend: Arc<Backend>,
	backend_model: Strng,
	priority: u32,
	weight: u32,
	declared_order: usize,
	kind: RouteKind,
}

impl<'a> Router<'a> {
	pub fn new(config: &'a Config, health: &'a HealthRegistry) -> Self {
		Self { config, health }
	}

	pub fn resolve(&self, alias: &str) -> Result<Vec<RouteCandidate>, Error> {
		let alias_def = self.config.aliases.get(alias).ok_or_else(|| Error::unknown_model(alias))?;

		if alias_def.routes.is_empty() && alias_def.fallback_aliases.is_empty() {
			return Err(Error::no_backend(format!("alias {alias} has no routes")));
		}

		let mut seen_backends = HashSet::new();
		let mut eligible = Vec::new();
		let mut cooling_down = Vec::new();
		let mut open = Vec::new();

		self.collect(alias, RouteKind::Primary, 0, &mut seen_backends, &mut eligible, &mut cooling_down, &mut open);

		eligible.sort_by(|a, b| {
			a.priority
				.cmp(&b.priority)
				.then(b.weight.cmp(&a.weight))
				.then(a.declared_order.cmp(&b.declared_order))
		});

		if !eligible.is_empty() {
			return Ok(eligible.into_iter().map(Self::to_candidate).collect());
		}

		// Step 6: relax — cooling-down backends ordered by cooldown_until
		// ascending, then Open-breaker backends.
		cooling_down.sort_by_key(|(until, _)| *until);
		let mut relaxed: Vec<ScoredRoute> = cooling_down.into_iter().map(|(_, r)| r).collect();
		relaxed.extend(open);

		if relaxed.is_empty() {
			return Err(Error::no_backend(format!("no eligible or recoverable backend for alias {alias}")));
		}
		Ok(relaxed.into_iter().map(Self::to_candidate).collect())
	}

	#[allow(clippy::too_many_arguments)]
	fn collect(
		&self,
		alias: &str,
		kind: RouteKind,
		depth: u32,
		seen_backends: &mut HashSet<Strng>,
		eligible: &mut Vec<ScoredRoute>,
		cooling_down: &mut Vec<(std::time::Instant, ScoredRoute)>,
		open: &mut Vec<ScoredRoute>,
	) {
		let Some(alias_def) = self.config.aliases.get(alias) else {
			return;
		};

		for (i, route) in alias_def.routes.iter().enumerate() {
			if seen_backends.contains(&route.backend) {
				continue;
			}
			let Some(backend) = self.config.backends.get(&route.backend) else {
				continue;
			};
			if !backend.enabled {
				continue;
			}
			seen_backends.insert(route.backend.clone());

			let health = self.health.get_or_insert(&route.backend);
			let scored = ScoredRoute {
				backend: backend.clone(),
				backend_model: route.backend_model.clone(),
				priority: route.priority,
				weight: route.weight,
				declared_order: i,
				kind,
			};

			if health.is_eligible(&self.config.circuit, self.config.in_flight_limit) {
				eligible.push(scored);
			} else if health.is_open() {
				open.push(scored);
			} else {
				let until = health.cooldown_until().unwrap_or_else(std::time::Instant::now);
				cooling_down.push((until, scored));
			}
		}

		if depth < MAX_FALLBACK_ALIAS_DEPTH {
			for fallback in &alias_def.fallback_aliases {
				self.collect(fallback, RouteKind::Fallback, depth + 1, seen_backends, eligible, cooling_down, open);
			}
		}
	}

	fn to_candidate(r: ScoredRoute) -> RouteCandidate {
		RouteCandidate {
			backend: r.backend,
			backend_model: r.backend_model,
			priority: r.priority,
			weight: r.weight,
			kind: r.kind,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn config(yaml: &str) -> Config {
		Config::from_yaml_str(yaml).expect("valid config")
	}

	const BASE: &str = r#"
backends:
  - name: b1
    baseUrl: https://api.openai.com
    apiKey: sk-1
    protocol: open-ai
  - name: b2
    baseUrl: https://api.openai.com
    apiKey: sk-2
    protocol: open-ai
aliases:
  - name: gpt-4
    routes:
      - { backend: b1, model: gpt-4o, priority: 0, weight: 1 }
      - { backend: b2, model: gpt-4o, priority: 1, weight: 1 }
"#;

	#[test]
	fn unknown_alias_is_validation_error() {
		let cfg = config(BASE);
		let health = HealthRegistry::new();
		let router = Router::new(&cfg, &health);
		let err = router.resolve("nope").unwrap_err();
		assert_eq!(err.code, crate::error::ErrorCode::UnknownModel);
	}

	#[test]
	fn orders_by_priority_then_declared_order() {
		let cfg = config(BASE);
		let health = HealthRegistry::new();
		let router = Router::new(&cfg, &health);
		let candidates = router.resolve("gpt-4").unwrap();
		assert_eq!(candidates.len(), 2);
		assert_eq!(candidates[0].backend.name, "b1");
		assert_eq!(candidates[1].backend.name, "b2");
	}

	#[test]
	fn relaxes_to_cooling_down_backend_as_last_resort() {
		let cfg = config(
			r#"
backends:
  - name: b1
    baseUrl: https://api.openai.com
    apiKey: sk-1
    protocol: open-ai
aliases:
  - name: gpt-4
    routes:
      - { backend: b1, model: gpt-4o }
"#,
		);
		let health = HealthRegistry::new();
		let rec = health.get_or_insert(&strng::literal("b1"));
		rec.record_failure(&cfg.circuit, true);

		let router = Router::new(&cfg, &health);
		let candidates = router.resolve("gpt-4").unwrap();
		assert_eq!(candidates.len(), 1);
		assert_eq!(candidates[0].backend.name, "b1");
	}

	#[test]
	fn dedupes_backend_shared_between_primary_and_fallback_alias() {
		let cfg = config(
			r#"
backends:
  - name: b1
    baseUrl: https://api.openai.com
    apiKey: sk-1
    protocol: open-ai
aliases:
  - name: gpt-4
    routes:
      - { backend: b1, model: gpt-4o }
    fallbackAliases: [gpt-4-mini]
  - name: gpt-4-mini
    routes:
      - { backend: b1, model: gpt-4o-mini }
"#,
		);
		let health = HealthRegistry::new();
		let router = Router::new(&cfg, &health);
		let candidates = router.resolve("gpt-4").unwrap();
		assert_eq!(candidates.len(), 1);
	}
}
