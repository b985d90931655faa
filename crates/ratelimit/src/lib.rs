//! Rate limiter (`spec.md` §4.7): four algorithms plus 429-aware
//! adaptive throttling, gating request dispatch per endpoint or
//! globally.
//!
//! Every algorithm takes an explicit `Instant` rather than reading
//! the wall clock itself, so callers (and tests) can advance time
//! deterministically instead of sleeping — the spec only requires
//! monotonic time, not any particular clock source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use connect_core::model::{OverflowStrategy, RateLimitAlgorithm, RateLimitConfig};

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Admitted immediately.
    Admit,
    /// Not admitted; caller should wait this long and retry (token
    /// bucket / leaky-bucket-queue mode), or treat as rejected
    /// (sliding/fixed window, leaky-bucket-drop mode).
    Wait(Duration),
    /// Rejected outright — no amount of waiting within this decision
    /// helps; caller must re-check later.
    Reject,
}

enum AlgorithmState {
    TokenBucket { tokens: f64, last_refill: Instant },
    SlidingWindow { timestamps: VecDeque<Instant> },
    FixedWindow { window_start: Instant, count: u64 },
    LeakyBucket { queue_len: f64, last_leak: Instant },
}

/// A single rate limiter instance, scoped to one endpoint or shared
/// globally per `spec.md` §4.7's "optional global limiter" note.
pub struct RateLimiter {
    config: Mutex<RateLimitConfig>,
    state: Mutex<AlgorithmState>,
    rejected: AtomicU64,
    admitted: AtomicU64,
    // Adaptive bookkeeping: successes/failures observed since the
    // adaptation window started.
    adaptive: Mutex<AdaptiveState>,
}

struct AdaptiveState {
    window_start: Instant,
    successes: u64,
    failures: u64,
    retry_after_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        let state = match config.algorithm {
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::Adaptive => {
                AlgorithmState::TokenBucket {
                    tokens: config.bucket_capacity,
                    last_refill: now,
                }
            }
            RateLimitAlgorithm::SlidingWindow => AlgorithmState::SlidingWindow {
                timestamps: VecDeque::new(),
            },
            RateLimitAlgorithm::FixedWindow => AlgorithmState::FixedWindow {
                window_start: now,
                count: 0,
            },
            RateLimitAlgorithm::LeakyBucket => AlgorithmState::LeakyBucket {
                queue_len: 0.0,
                last_leak: now,
            },
        };
        Self {
            config: Mutex::new(config),
            state: Mutex::new(state),
            rejected: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            adaptive: Mutex::new(AdaptiveState {
                window_start: now,
                successes: 0,
                failures: 0,
                retry_after_until: None,
            }),
        }
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Attempt to acquire a single permit at `now`.
    pub fn try_acquire_at(&self, now: Instant) -> Decision {
        let config = self.config.lock().unwrap();
        if !config.enabled {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Decision::Admit;
        }

        if config.algorithm == RateLimitAlgorithm::Adaptive {
            let adaptive = self.adaptive.lock().unwrap();
            if let Some(until) = adaptive.retry_after_until {
                if now < until {
                    drop(adaptive);
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Decision::Wait(until - now);
                }
            }
        }

        let decision = match config.algorithm {
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::Adaptive => {
                self.token_bucket_acquire(now, config.requests_per_second, config.bucket_capacity)
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.sliding_window_acquire(now, config.requests_per_second, config.window_size_ms)
            }
            RateLimitAlgorithm::FixedWindow => {
                self.fixed_window_acquire(now, config.requests_per_second as u64, config.window_size_ms)
            }
            RateLimitAlgorithm::LeakyBucket => self.leaky_bucket_acquire(
                now,
                config.leak_rate,
                config.bucket_capacity,
                config.overflow_strategy,
            ),
        };

        match decision {
            Decision::Admit => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        decision
    }

    fn token_bucket_acquire(&self, now: Instant, rate: f64, capacity: f64) -> Decision {
        let mut state = self.state.lock().unwrap();
        if let AlgorithmState::TokenBucket { tokens, last_refill } = &mut *state {
            let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
            *tokens = (*tokens + elapsed * rate).min(capacity);
            *last_refill = now;

            if *tokens >= 1.0 {
                *tokens -= 1.0;
                Decision::Admit
            } else {
                let deficit = 1.0 - *tokens;
                let wait_secs = if rate > 0.0 { deficit / rate } else { f64::MAX };
                Decision::Wait(Duration::from_secs_f64(wait_secs.max(0.0)))
            }
        } else {
            unreachable!("token bucket state mismatch")
        }
    }

    fn sliding_window_acquire(&self, now: Instant, limit_per_sec: f64, window_ms: u64) -> Decision {
        let window = Duration::from_millis(window_ms);
        let limit = (limit_per_sec * window.as_secs_f64()).round().max(1.0) as usize;
        let mut state = self.state.lock().unwrap();
        if let AlgorithmState::SlidingWindow { timestamps } = &mut *state {
            while let Some(front) = timestamps.front() {
                if now.saturating_duration_since(*front) > window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            if timestamps.len() < limit {
                timestamps.push_back(now);
                Decision::Admit
            } else {
                Decision::Reject
            }
        } else {
            unreachable!("sliding window state mismatch")
        }
    }

    fn fixed_window_acquire(&self, now: Instant, limit: u64, window_ms: u64) -> Decision {
        let window = Duration::from_millis(window_ms.max(1));
        let mut state = self.state.lock().unwrap();
        if let AlgorithmState::FixedWindow { window_start, count } = &mut *state {
            if now.saturating_duration_since(*window_start) >= window {
                *window_start = now;
                *count = 0;
            }
            if *count < limit.max(1) {
                *count += 1;
                Decision::Admit
            } else {
                Decision::Reject
            }
        } else {
            unreachable!("fixed window state mismatch")
        }
    }

    fn leaky_bucket_acquire(
        &self,
        now: Instant,
        leak_rate: f64,
        capacity: f64,
        overflow: OverflowStrategy,
    ) -> Decision {
        let mut state = self.state.lock().unwrap();
        if let AlgorithmState::LeakyBucket { queue_len, last_leak } = &mut *state {
            let elapsed = now.saturating_duration_since(*last_leak).as_secs_f64();
            *queue_len = (*queue_len - elapsed * leak_rate).max(0.0);
            *last_leak = now;

            if *queue_len + 1.0 <= capacity {
                *queue_len += 1.0;
                Decision::Admit
            } else {
                match overflow {
                    OverflowStrategy::Drop => Decision::Reject,
                    OverflowStrategy::Queue => {
                        let wait_secs = if leak_rate > 0.0 {
                            (*queue_len + 1.0 - capacity) / leak_rate
                        } else {
                            f64::MAX
                        };
                        Decision::Wait(Duration::from_secs_f64(wait_secs.max(0.0)))
                    }
                }
            }
        } else {
            unreachable!("leaky bucket state mismatch")
        }
    }

    /// Feed back the outcome of a dispatched request (`spec.md`
    /// §4.7's adaptive behavior): a 429 halves the rate and starts an
    /// honor-`Retry-After` cooldown; sustained success above
    /// `success_threshold` over `adaptation_window` raises it back.
    pub fn on_response(&self, now: Instant, status: u16, retry_after: Option<Duration>) {
        let mut config = self.config.lock().unwrap();
        if config.algorithm != RateLimitAlgorithm::Adaptive {
            return;
        }

        let mut adaptive = self.adaptive.lock().unwrap();
        if status == 429 {
            config.requests_per_second = (config.requests_per_second / 2.0).max(config.min_rate);
            if let Some(ra) = retry_after {
                adaptive.retry_after_until = Some(now + ra);
            }
            adaptive.failures += 1;
            adaptive.window_start = now;
            adaptive.successes = 0;
            return;
        }

        if (200..300).contains(&status) {
            adaptive.successes += 1;
        } else {
            adaptive.failures += 1;
        }

        let window = Duration::from_secs(config.adaptation_window_secs);
        if now.saturating_duration_since(adaptive.window_start) >= window {
            let total = adaptive.successes + adaptive.failures;
            if total > 0 {
                let ratio = adaptive.successes as f64 / total as f64;
                if ratio >= config.success_threshold {
                    let ceiling = RateLimitConfig::default().requests_per_second.max(config.requests_per_second);
                    config.requests_per_second =
                        (config.requests_per_second * config.adaptation_factor).min(ceiling.max(config.requests_per_second));
                }
            }
            adaptive.window_start = now;
            adaptive.successes = 0;
            adaptive.failures = 0;
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.config.lock().unwrap().requests_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_core::model::RateLimitConfig;

    fn cfg(algorithm: RateLimitAlgorithm) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            algorithm,
            ..RateLimitConfig::default()
        }
    }

    #[test]
    fn token_bucket_admits_burst_then_throttles() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::TokenBucket,
                requests_per_second: 2.0,
                bucket_capacity: 3.0,
                ..RateLimitConfig::default()
            },
            start,
        );

        // First 3 requests consume the full bucket immediately.
        for _ in 0..3 {
            assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        }
        // 4th is throttled.
        match limiter.try_acquire_at(start) {
            Decision::Wait(_) => {}
            other => panic!("expected Wait, got {other:?}"),
        }
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::TokenBucket,
                requests_per_second: 2.0,
                bucket_capacity: 1.0,
                ..RateLimitConfig::default()
            },
            start,
        );
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert!(matches!(limiter.try_acquire_at(start), Decision::Wait(_)));

        let later = start + Duration::from_millis(600);
        assert_eq!(limiter.try_acquire_at(later), Decision::Admit);
    }

    #[test]
    fn sliding_window_enforces_limit_per_window() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::SlidingWindow,
                requests_per_second: 2.0,
                window_size_ms: 1_000,
                ..RateLimitConfig::default()
            },
            start,
        );
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert_eq!(limiter.try_acquire_at(start), Decision::Reject);

        let later = start + Duration::from_millis(1_100);
        assert_eq!(limiter.try_acquire_at(later), Decision::Admit);
    }

    #[test]
    fn fixed_window_resets_on_boundary() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::FixedWindow,
                requests_per_second: 2.0,
                window_size_ms: 1_000,
                ..RateLimitConfig::default()
            },
            start,
        );
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert_eq!(limiter.try_acquire_at(start), Decision::Reject);

        let next_window = start + Duration::from_millis(1_000);
        assert_eq!(limiter.try_acquire_at(next_window), Decision::Admit);
    }

    #[test]
    fn leaky_bucket_drops_on_overflow() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::LeakyBucket,
                leak_rate: 1.0,
                bucket_capacity: 2.0,
                overflow_strategy: OverflowStrategy::Drop,
                ..RateLimitConfig::default()
            },
            start,
        );
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert_eq!(limiter.try_acquire_at(start), Decision::Reject);
    }

    #[test]
    fn leaky_bucket_queues_on_overflow() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::LeakyBucket,
                leak_rate: 1.0,
                bucket_capacity: 1.0,
                overflow_strategy: OverflowStrategy::Queue,
                ..RateLimitConfig::default()
            },
            start,
        );
        assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        assert!(matches!(limiter.try_acquire_at(start), Decision::Wait(_)));
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let start = Instant::now();
        let limiter = RateLimiter::new(RateLimitConfig::default(), start);
        for _ in 0..100 {
            assert_eq!(limiter.try_acquire_at(start), Decision::Admit);
        }
    }

    #[test]
    fn adaptive_halves_rate_on_429_and_honors_retry_after() {
        let start = Instant::now();
        let limiter = RateLimiter::new(cfg(RateLimitAlgorithm::Adaptive), start);
        let initial_rate = limiter.current_rate();

        limiter.on_response(start, 429, Some(Duration::from_secs(5)));
        assert!((limiter.current_rate() - initial_rate / 2.0).abs() < 1e-9);

        match limiter.try_acquire_at(start + Duration::from_secs(1)) {
            Decision::Wait(_) => {}
            other => panic!("expected cooldown wait, got {other:?}"),
        }

        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_secs(6)),
            Decision::Admit
        );
    }

    #[test]
    fn rejection_counter_tracks_denied_requests() {
        let start = Instant::now();
        let limiter = RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                algorithm: RateLimitAlgorithm::FixedWindow,
                requests_per_second: 1.0,
                window_size_ms: 1_000,
                ..RateLimitConfig::default()
            },
            start,
        );
        limiter.try_acquire_at(start);
        limiter.try_acquire_at(start);
        limiter.try_acquire_at(start);
        assert_eq!(limiter.rejected_count(), 2);
        assert_eq!(limiter.admitted_count(), 1);
    }
}
