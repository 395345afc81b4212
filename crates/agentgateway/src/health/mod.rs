//! Per-backend health state: cooldown timer, three-state circuit breaker,
//! and in-flight concurrency limiter. One `BackendHealthRecord`
//! per backend name, created lazily and never destroyed, held in a
//! process-wide `flurry::HashMap` so lookups never block a writer elsewhere
//! in the map.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use agent_core::prelude::*;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
	pub failure_threshold: u32,
	pub success_threshold: u32,
	pub open_timeout: Duration,
	pub cooldown: Duration,
}

impl Default for CircuitConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			success_threshold: 2,
			open_timeout: Duration::from_secs(30),
			cooldown: Duration::from_secs(10),
		}
	}
}

struct Inner {
	state: CircuitState,
	consecutive_failures: u32,
	consecutive_successes: u32,
	opened_at: Option<Instant>,
	cooldown_until: Option<Instant>,
	/// Gates HalfOpen to a single trial request to avoid a thundering herd
	/// re-tripping the breaker the instant it cracks open.
	half_open_in_flight: bool,
}

impl Default for Inner {
	fn default() -> Self {
		Self {
			state: CircuitState::Closed,
			consecutive_failures: 0,
			consecutive_successes: 0,
			opened_at: None,
			cooldown_until: None,
			half_open_in_flight: false,
		}
	}
}

pub struct BackendHealthRecord {
	inner: Mutex<Inner>,
	in_flight: AtomicU32,
}

impl Default for BackendHealthRecord {
	fn default() -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			in_flight: AtomicU32::new(0),
		}
	}
}

/// Owns a clone of the backend's `Arc` rather than borrowing it, so a guard
/// acquired for a streaming request can outlive the call that acquired it
/// and be dropped only once the stream itself completes.
pub struct InFlightGuard {
	record: Arc<BackendHealthRecord>,
	half_open_trial: bool,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.record.in_flight.fetch_sub(1, Ordering::AcqRel);
		if self.half_open_trial {
			self.record.inner.lock().half_open_in_flight = false;
		}
	}
}

impl InFlightGuard {
	pub fn record_success(&self, cfg: &CircuitConfig) {
		self.record.record_success(cfg);
	}

	pub fn record_failure(&self, cfg: &CircuitConfig, retryable: bool) {
		self.record.record_failure(cfg, retryable);
	}
}

impl BackendHealthRecord {
	fn maybe_advance_open_to_half_open(&self, inner: &mut Inner, cfg: &CircuitConfig, now: Instant) {
		if inner.state == CircuitState::Open {
			if let Some(opened_at) = inner.opened_at {
				if now.duration_since(opened_at) >= cfg.open_timeout {
					inner.state = CircuitState::HalfOpen;
					inner.consecutive_successes = 0;
				}
			}
		}
	}

	pub fn cooldown_until(&self) -> Option<Instant> {
		self.inner.lock().cooldown_until
	}

	pub fn in_flight(&self) -> u32 {
		self.in_flight.load(Ordering::Acquire)
	}

	/// Eligibility = not-in-cooldown ∧ breaker≠Open ∧ in-flight<limit
	///. Lazily advances Open→HalfOpen on read.
	pub fn is_eligible(&self, cfg: &CircuitConfig, in_flight_limit: Option<u32>) -> bool {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		self.maybe_advance_open_to_half_open(&mut inner, cfg, now);

		if let Some(until) = inner.cooldown_until {
			if until > now {
				return false;
			}
		}
		if inner.state == CircuitState::Open {
			return false;
		}
		if let Some(limit) = in_flight_limit {
			if self.in_flight.load(Ordering::Acquire) >= limit {
				return false;
			}
		}
		if inner.state == CircuitState::HalfOpen && inner.half_open_in_flight {
			return false;
		}
		true
	}

	pub fn is_cooling_down(&self) -> bool {
		self.inner.lock().cooldown_until.is_some_and(|u| u > Instant::now())
	}

	pub fn is_open(&self) -> bool {
		self.inner.lock().state == CircuitState::Open
	}

	/// Acquire an in-flight slot on `record`. Returns `None` if the configured
	/// limit is already reached, in which case the caller must skip this
	/// backend and try the next candidate without counting an attempt.
	///
	/// Takes the backend's `Arc` (rather than `&self`) so the returned guard
	/// can be moved into a streaming response body and released only once
	/// that stream completes, instead of at the point of acquisition.
	pub fn try_acquire(record: &Arc<BackendHealthRecord>, in_flight_limit: Option<u32>) -> Option<InFlightGuard> {
		if let Some(limit) = in_flight_limit {
			loop {
				let cur = record.in_flight.load(Ordering::Acquire);
				if cur >= limit {
					return None;
				}
				if record
					.in_flight
					.compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
				{
					break;
				}
			}
		} else {
			record.in_flight.fetch_add(1, Ordering::AcqRel);
		}

		let mut half_open_trial = false;
		{
			let mut inner = record.inner.lock();
			if inner.state == CircuitState::HalfOpen {
				if inner.half_open_in_flight {
					drop(inner);
					record.in_flight.fetch_sub(1, Ordering::AcqRel);
					return None;
				}
				inner.half_open_in_flight = true;
				half_open_trial = true;
			}
		}
		Some(InFlightGuard {
			record: Arc::clone(record),
			half_open_trial,
		})
	}

	pub fn record_success(&self, cfg: &CircuitConfig) {
		let mut inner = self.inner.lock();
		inner.consecutive_failures = 0;
		match inner.state {
			CircuitState::HalfOpen => {
				inner.consecutive_successes += 1;
				if inner.consecutive_successes >= cfg.success_threshold {
					inner.state = CircuitState::Closed;
					inner.consecutive_successes = 0;
					inner.opened_at = None;
				}
			},
			CircuitState::Closed => {},
			CircuitState::Open => {},
		}
	}

	pub fn record_failure(&self, cfg: &CircuitConfig, retryable: bool) {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		inner.consecutive_successes = 0;
		inner.consecutive_failures += 1;

		if retryable {
			inner.cooldown_until = Some(now + cfg.cooldown);
		}

		match inner.state {
			CircuitState::Closed => {
				if inner.consecutive_failures >= cfg.failure_threshold {
					inner.state = CircuitState::Open;
					inner.opened_at = Some(now);
				}
			},
			CircuitState::HalfOpen => {
				inner.state = CircuitState::Open;
				inner.opened_at = Some(now);
			},
			CircuitState::Open => {},
		}
	}

	pub fn state(&self) -> CircuitState {
		self.inner.lock().state
	}
}

/// Process-wide registry, one record per backend name.
pub struct HealthRegistry {
	map: flurry::HashMap<Strng, Arc<BackendHealthRecord>>,
}

impl Default for HealthRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl HealthRegistry {
	pub fn new() -> Self {
		Self {
			map: flurry::HashMap::new(),
		}
	}

	pub fn get_or_insert(&self, backend: &Strng) -> Arc<BackendHealthRecord> {
		let guard = self.map.guard();
		if let Some(existing) = self.map.get(backend, &guard) {
			return existing.clone();
		}
		let record = Arc::new(BackendHealthRecord::default());
		match self.map.try_insert(backend.clone(), record.clone(), &guard) {
			Ok(_) => record,
			Err(e) => e.current.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> CircuitConfig {
		CircuitConfig {
			failure_threshold: 3,
			success_threshold: 2,
			open_timeout: Duration::from_millis(20),
			cooldown: Duration::from_millis(5),
		}
	}

	#[rstest::rstest]
	#[case(1, false)]
	#[case(2, false)]
	#[case(3, true)]
	#[case(5, true)]
	fn opens_exactly_at_threshold_not_before(#[case] failures: u32, #[case] expect_open: bool) {
		let r = BackendHealthRecord::default();
		let c = cfg();
		for _ in 0..failures {
			r.record_failure(&c, true);
		}
		assert_eq!(r.state() == CircuitState::Open, expect_open);
	}

	#[test]
	fn opens_after_threshold_failures() {
		let r = BackendHealthRecord::default();
		let c = cfg();
		for _ in 0..3 {
			r.record_failure(&c, true);
		}
		assert_eq!(r.state(), CircuitState::Open);
		assert!(!r.is_eligible(&c, None));
	}

	#[test]
	fn half_open_then_closes_on_successes() {
		let r = BackendHealthRecord::default();
		let c = cfg();
		for _ in 0..3 {
			r.record_failure(&c, true);
		}
		std::thread::sleep(Duration::from_millis(25));
		assert!(r.is_eligible(&c, None));
		assert_eq!(r.state(), CircuitState::HalfOpen);
		r.record_success(&c);
		r.record_success(&c);
		assert_eq!(r.state(), CircuitState::Closed);
	}

	#[test]
	fn half_open_failure_reopens() {
		let r = BackendHealthRecord::default();
		let c = cfg();
		for _ in 0..3 {
			r.record_failure(&c, true);
		}
		std::thread::sleep(Duration::from_millis(25));
		assert!(r.is_eligible(&c, None));
		r.record_failure(&c, true);
		assert_eq!(r.state(), CircuitState::Open);
	}

	#[test]
	fn half_open_gates_single_trial() {
		let r = Arc::new(BackendHealthRecord::default());
		let c = cfg();
		for _ in 0..3 {
			r.record_failure(&c, true);
		}
		std::thread::sleep(Duration::from_millis(25));
		assert!(r.is_eligible(&c, None));
		let g1 = BackendHealthRecord::try_acquire(&r, None);
		assert!(g1.is_some());
		assert!(!r.is_eligible(&c, None));
		drop(g1);
		assert!(r.is_eligible(&c, None));
	}

	#[test]
	fn cooldown_blocks_eligibility() {
		let r = BackendHealthRecord::default();
		let c = cfg();
		r.record_failure(&c, true);
		assert!(!r.is_eligible(&c, None));
		std::thread::sleep(Duration::from_millis(10));
		assert!(r.is_eligible(&c, None));
	}

	#[test]
	fn in_flight_limit_blocks_acquire() {
		let r = Arc::new(BackendHealthRecord::default());
		let _g = BackendHealthRecord::try_acquire(&r, Some(1)).unwrap();
		assert!(BackendHealthRecord::try_acquire(&r, Some(1)).is_none());
	}

	/// Guards acquired for a streaming request must be movable out of the
	/// scope that acquired them and still release the in-flight slot (and
	/// the HalfOpen single-trial gate) whenever they're eventually dropped,
	/// not at acquisition time.
	#[test]
	fn guard_can_be_moved_and_releases_on_drop() {
		let r = Arc::new(BackendHealthRecord::default());
		let guard = BackendHealthRecord::try_acquire(&r, Some(1)).unwrap();
		assert_eq!(r.in_flight(), 1);
		let held = std::thread::spawn(move || {
			std::thread::sleep(Duration::from_millis(5));
			drop(guard);
		});
		assert_eq!(r.in_flight(), 1);
		held.join().unwrap();
		assert_eq!(r.in_flight(), 0);
	}

	#[test]
	fn registry_is_lazy_and_stable() {
		let reg = HealthRegistry::new();
		let a = reg.get_or_insert(&strng::literal("b1"));
		let b = reg.get_or_insert(&strng::literal("b1"));
		assert!(Arc::ptr_eq(&a, &b));
	}
}
