//! Circuit breaker (`spec.md` §4.5), one instance per bulkhead group.
//! Endpoints with no configured `bulkhead_group` each get their own
//! group keyed by endpoint id, so isolation is the default and
//! sharing is opt-in.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use connect_core::error::ErrorClass;
use connect_core::model::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probes_in_flight: u32, successes: u32 },
}

/// A single breaker instance (one per bulkhead group).
pub struct Breaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Outcome of asking the breaker for permission to call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match &*self.inner.lock().unwrap() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Request permission to issue a call at `now`. `Open` becomes
    /// `HalfOpen` automatically once `reset_timeout` has elapsed.
    pub fn try_call_at(&self, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed { .. } => Admission::Allowed,
            Inner::Open { opened_at } => {
                let reset_timeout = Duration::from_millis(self.config.reset_timeout_ms);
                if now.saturating_duration_since(*opened_at) >= reset_timeout {
                    *inner = Inner::HalfOpen { probes_in_flight: 1, successes: 0 };
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
            Inner::HalfOpen { probes_in_flight, .. } => {
                if *probes_in_flight < self.config.half_open_max_calls {
                    *probes_in_flight += 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record the outcome of a call admitted by `try_call_at`.
    pub fn record_success_at(&self, now: Instant) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Closed { failures } => *failures = 0,
            Inner::HalfOpen { successes, .. } => {
                *successes += 1;
                if *successes >= self.config.half_open_required_successes {
                    *inner = Inner::Closed { failures: 0 };
                }
            }
            Inner::Open { .. } => {
                // A success should not reach us while Open (no calls were
                // admitted), but tolerate it defensively.
                *inner = Inner::HalfOpen { probes_in_flight: 0, successes: 1 };
                let _ = now;
            }
        }
    }

    /// Record a failed call, classified per `spec.md` §7. A
    /// `ClientPermanent`-class failure (or any class that
    /// `opens_breaker_immediately`) trips the breaker regardless of
    /// the failure counter.
    pub fn record_failure_at(&self, now: Instant, class: ErrorClass) {
        if !self.config.enabled || !class.trips_breaker() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if class.opens_breaker_immediately() {
            *inner = Inner::Open { opened_at: now };
            return;
        }
        match &mut *inner {
            Inner::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    *inner = Inner::Open { opened_at: now };
                }
            }
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open { opened_at: now };
            }
            Inner::Open { .. } => {}
        }
    }
}

/// Registry of breakers keyed by bulkhead group (defaulting to the
/// endpoint's own id when no group is configured).
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, std::sync::Arc<Breaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self { breakers: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, endpoint_id: &str, config: &BreakerConfig) -> std::sync::Arc<Breaker> {
        let key = config.bulkhead_group.clone().unwrap_or_else(|| endpoint_id.to_string());
        let mut map = self.breakers.lock().unwrap();
        map.entry(key)
            .or_insert_with(|| std::sync::Arc::new(Breaker::new(config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_ms: u64) -> BreakerConfig {
        BreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_max_calls: 1,
            half_open_required_successes: 1,
            bulkhead_group: None,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = Breaker::new(config(2, 1_000));
        let t0 = Instant::now();
        assert_eq!(b.try_call_at(t0), Admission::Allowed);
        b.record_failure_at(t0, ErrorClass::ServerTransient);
        assert_eq!(b.state(), BreakerState::Closed);

        assert_eq!(b.try_call_at(t0), Admission::Allowed);
        b.record_failure_at(t0, ErrorClass::ServerTransient);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn rejects_while_open_then_half_opens_after_timeout() {
        let b = Breaker::new(config(1, 1_000));
        let t0 = Instant::now();
        b.try_call_at(t0);
        b.record_failure_at(t0, ErrorClass::ServerTransient);
        assert_eq!(b.state(), BreakerState::Open);

        assert_eq!(b.try_call_at(t0 + Duration::from_millis(500)), Admission::Rejected);

        let t1 = t0 + Duration::from_millis(1_100);
        assert_eq!(b.try_call_at(t1), Admission::Allowed);
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = Breaker::new(config(1, 1_000));
        let t0 = Instant::now();
        b.try_call_at(t0);
        b.record_failure_at(t0, ErrorClass::ServerTransient);

        let t1 = t0 + Duration::from_millis(1_100);
        b.try_call_at(t1);
        b.record_failure_at(t1, ErrorClass::ServerTransient);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_success_closes() {
        let b = Breaker::new(config(1, 1_000));
        let t0 = Instant::now();
        b.try_call_at(t0);
        b.record_failure_at(t0, ErrorClass::ServerTransient);

        let t1 = t0 + Duration::from_millis(1_100);
        b.try_call_at(t1);
        b.record_success_at(t1);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn client_permanent_opens_immediately_regardless_of_threshold() {
        let b = Breaker::new(config(10, 1_000));
        let t0 = Instant::now();
        b.try_call_at(t0);
        b.record_failure_at(t0, ErrorClass::ClientPermanent);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn breaker_open_class_does_not_count_toward_closed_failures() {
        let b = Breaker::new(config(2, 1_000));
        let t0 = Instant::now();
        b.record_failure_at(t0, ErrorClass::BreakerOpen);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let mut cfg = config(1, 1_000);
        cfg.enabled = false;
        let b = Breaker::new(cfg);
        let t0 = Instant::now();
        b.record_failure_at(t0, ErrorClass::ServerTransient);
        assert_eq!(b.try_call_at(t0), Admission::Allowed);
    }

    #[test]
    fn bulkhead_groups_isolate_failures() {
        let registry = BreakerRegistry::new();
        let mut cfg_a = config(1, 1_000);
        cfg_a.bulkhead_group = Some("shared".into());
        let mut cfg_b = cfg_a.clone();
        cfg_b.bulkhead_group = Some("shared".into());

        let breaker_a = registry.get_or_create("api1", &cfg_a);
        let breaker_b = registry.get_or_create("api2", &cfg_b);
        assert!(std::sync::Arc::ptr_eq(&breaker_a, &breaker_b));

        let mut cfg_c = config(1, 1_000);
        cfg_c.bulkhead_group = Some("isolated".into());
        let breaker_c = registry.get_or_create("api3", &cfg_c);

        let t0 = Instant::now();
        breaker_a.record_failure_at(t0, ErrorClass::ClientPermanent);
        assert_eq!(breaker_a.state(), BreakerState::Open);
        assert_eq!(breaker_c.state(), BreakerState::Closed);
    }
}
