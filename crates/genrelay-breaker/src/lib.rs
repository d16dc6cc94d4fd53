//! Per-key circuit breaker over a sliding time-bucket window.
//!
//! Keys are `provider:model` strings, created lazily on first use and kept
//! for process lifetime. Outcomes are counted into fixed-duration buckets so
//! stale observations age out without rescanning history. Transitions follow
//! CLOSED → OPEN → HALF_OPEN → {CLOSED | OPEN}.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use genrelay_config::BreakerConfig;
use genrelay_core::ErrorCategory;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of one circuit for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub windowed_successes: u32,
    pub windowed_failures: u32,
    pub failure_ratio: f64,
}

#[derive(Debug)]
struct Bucket {
    /// Bucket index since the breaker's epoch.
    index: u64,
    successes: u32,
    failures: u32,
}

#[derive(Debug)]
struct CircuitData {
    state: CircuitState,
    buckets: VecDeque<Bucket>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl CircuitData {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            buckets: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }

    fn prune(&mut self, current_index: u64, bucket_count: u32) {
        let oldest_kept = current_index.saturating_sub(u64::from(bucket_count) - 1);
        while let Some(front) = self.buckets.front() {
            if front.index < oldest_kept {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn bucket_mut(&mut self, current_index: u64) -> &mut Bucket {
        if self.buckets.back().is_none_or(|b| b.index != current_index) {
            self.buckets.push_back(Bucket {
                index: current_index,
                successes: 0,
                failures: 0,
            });
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }

    fn totals(&self) -> (u32, u32) {
        self.buckets.iter().fold((0, 0), |(s, f), b| {
            (s + b.successes, f + b.failures)
        })
    }
}

/// Keyed circuit breaker. All state is behind one mutex; entry points are
/// short and never await while holding it.
pub struct CircuitBreaker {
    config: BreakerConfig,
    epoch: Instant,
    circuits: Mutex<HashMap<String, CircuitData>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn current_index(&self) -> u64 {
        (self.epoch.elapsed().as_millis() / u128::from(self.config.bucket_duration_ms)) as u64
    }

    /// Whether a call against `key` may proceed right now.
    ///
    /// Evaluating an open circuit whose cooldown has elapsed moves it to
    /// half-open; in half-open this admits (and accounts for) one probe.
    pub fn can_execute(&self, key: &str) -> bool {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let data = circuits.entry(key.to_string()).or_insert_with(CircuitData::new);

        match data.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = data
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown());
                if !cooled {
                    return false;
                }
                info!(key, "circuit cooldown elapsed, entering half-open");
                data.state = CircuitState::HalfOpen;
                data.half_open_in_flight = 0;
                data.half_open_successes = 0;
                Self::admit_probe(data, self.config.half_open_max_calls)
            }
            CircuitState::HalfOpen => Self::admit_probe(data, self.config.half_open_max_calls),
        }
    }

    fn admit_probe(data: &mut CircuitData, max_calls: u32) -> bool {
        if data.half_open_in_flight < max_calls {
            data.half_open_in_flight += 1;
            true
        } else {
            false
        }
    }

    /// Non-mutating check used for candidate skipping: `true` only while the
    /// circuit is open and still cooling down. Never consumes a probe slot.
    pub fn is_open(&self, key: &str) -> bool {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let Some(data) = circuits.get(key) else {
            return false;
        };
        data.state == CircuitState::Open
            && !data
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.cooldown())
    }

    /// Record the outcome of a finished call. `None` is a success; failures
    /// only count when their category is breaker-relevant. Irrelevant
    /// categories (auth/safety/cancel/parse) say nothing about provider
    /// health: a half-open probe ending in one still frees its slot, but
    /// neither reopens the circuit nor counts toward closing it.
    pub fn record_outcome(&self, key: &str, error: Option<&ErrorCategory>) {
        let relevant_failure = error.is_some_and(|c| c.counts_for_breaker());
        let neutral = error.is_some_and(|c| !c.counts_for_breaker());

        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let data = circuits.entry(key.to_string()).or_insert_with(CircuitData::new);
        let index = self.current_index();

        match data.state {
            CircuitState::HalfOpen => {
                // A finished probe always releases its slot, whatever it
                // returned.
                data.half_open_in_flight = data.half_open_in_flight.saturating_sub(1);
                if relevant_failure {
                    warn!(key, "half-open probe failed, reopening circuit");
                    data.state = CircuitState::Open;
                    data.opened_at = Some(Instant::now());
                    data.half_open_in_flight = 0;
                    data.half_open_successes = 0;
                } else if !neutral {
                    data.half_open_successes += 1;
                    if data.half_open_successes >= self.config.half_open_success_threshold {
                        info!(key, "circuit closed after successful probes");
                        data.state = CircuitState::Closed;
                        data.buckets.clear();
                        data.opened_at = None;
                        data.half_open_in_flight = 0;
                        data.half_open_successes = 0;
                    }
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                if neutral {
                    return;
                }
                data.prune(index, self.config.bucket_count);
                let bucket = data.bucket_mut(index);
                if relevant_failure {
                    bucket.failures += 1;
                } else {
                    bucket.successes += 1;
                }

                if data.state == CircuitState::Closed {
                    let (successes, failures) = data.totals();
                    let total = successes + failures;
                    if total >= self.config.minimum_requests {
                        let ratio = f64::from(failures) / f64::from(total);
                        if ratio >= self.config.failure_threshold {
                            warn!(
                                key,
                                failures,
                                total,
                                ratio = format!("{ratio:.2}"),
                                "failure ratio over threshold, opening circuit"
                            );
                            data.state = CircuitState::Open;
                            data.opened_at = Some(Instant::now());
                        }
                    }
                }
            }
        }
    }

    /// Diagnostic snapshot for one key.
    pub fn stats(&self, key: &str) -> CircuitStats {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let index = self.current_index();
        let data = circuits.entry(key.to_string()).or_insert_with(CircuitData::new);
        data.prune(index, self.config.bucket_count);
        let (successes, failures) = data.totals();
        let total = successes + failures;
        CircuitStats {
            state: data.state,
            windowed_successes: successes,
            windowed_failures: failures,
            failure_ratio: if total == 0 {
                0.0
            } else {
                f64::from(failures) / f64::from(total)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BreakerConfig {
        BreakerConfig {
            bucket_count: 6,
            bucket_duration_ms: 10_000,
            failure_threshold: 0.5,
            minimum_requests: 4,
            cooldown_ms: 30_000,
            half_open_max_calls: 2,
            half_open_success_threshold: 2,
        }
    }

    fn transient() -> ErrorCategory {
        ErrorCategory::RetryableTransient
    }

    fn trip(breaker: &CircuitBreaker, key: &str) {
        for _ in 0..4 {
            breaker.record_outcome(key, Some(&transient()));
        }
        assert!(!breaker.can_execute(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_allows_all() {
        let breaker = CircuitBreaker::new(config());
        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", None);
        assert!(breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_at_threshold_with_minimum_sample() {
        let breaker = CircuitBreaker::new(config());

        // 2 failures / 3 total: ratio over threshold but below minimum sample.
        breaker.record_outcome("a:m", Some(&transient()));
        breaker.record_outcome("a:m", Some(&transient()));
        breaker.record_outcome("a:m", None);
        assert!(breaker.can_execute("a:m"));

        // 4th observation reaches the sample size at ratio 0.5.
        breaker.record_outcome("a:m", Some(&transient()));
        assert_eq!(breaker.stats("a:m").state, CircuitState::Open);
        assert!(!breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_irrelevant_failures_never_trip() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..20 {
            breaker.record_outcome("a:m", Some(&ErrorCategory::Auth));
        }
        assert!(breaker.can_execute("a:m"));
        let stats = breaker.stats("a:m");
        assert_eq!(stats.windowed_failures, 0);
        assert_eq!(stats.windowed_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_failures_do_not_count() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..20 {
            breaker.record_outcome("a:m", Some(&ErrorCategory::RetryableParse));
        }
        assert!(breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_until_cooldown() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(!breaker.can_execute("a:m"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.can_execute("a:m"));
        assert_eq!(breaker.stats("a:m").state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_max_probes() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        tokio::time::advance(Duration::from_millis(30_000)).await;

        assert!(breaker.can_execute("a:m"));
        assert!(breaker.can_execute("a:m"));
        // Third concurrent probe rejected.
        assert!(!breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        tokio::time::advance(Duration::from_millis(30_000)).await;

        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", Some(&transient()));
        assert_eq!(breaker.stats("a:m").state, CircuitState::Open);
        assert!(!breaker.can_execute("a:m"));

        // The reopened circuit needs a full new cooldown.
        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(!breaker.can_execute("a:m"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_probe_successes_close_and_clear() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        tokio::time::advance(Duration::from_millis(30_000)).await;

        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", None);
        assert_eq!(breaker.stats("a:m").state, CircuitState::HalfOpen);

        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", None);

        let stats = breaker.stats("a:m");
        assert_eq!(stats.state, CircuitState::Closed);
        // History cleared: the pre-trip failures are gone.
        assert_eq!(stats.windowed_failures, 0);
        assert_eq!(stats.windowed_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_neutral_probe_outcome_frees_slot_without_transition() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        tokio::time::advance(Duration::from_millis(30_000)).await;

        assert!(breaker.can_execute("a:m"));
        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", Some(&ErrorCategory::RetryableParse));
        breaker.record_outcome("a:m", Some(&ErrorCategory::Cancelled));

        // Both slots are free again and the circuit stayed half-open.
        assert_eq!(breaker.stats("a:m").state, CircuitState::HalfOpen);
        assert!(breaker.can_execute("a:m"));
        assert!(breaker.can_execute("a:m"));
        assert!(!breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_via_successes_after_neutral_probe_outcome() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        tokio::time::advance(Duration::from_millis(30_000)).await;

        // A probe ending in an auth error counts neither way.
        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", Some(&ErrorCategory::Auth));
        assert_eq!(breaker.stats("a:m").state, CircuitState::HalfOpen);

        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", None);
        assert!(breaker.can_execute("a:m"));
        breaker.record_outcome("a:m", None);
        assert_eq!(breaker.stats("a:m").state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observations_age_out_of_window() {
        let breaker = CircuitBreaker::new(config());

        // 3 failures now; not enough to trip (minimum 4).
        for _ in 0..3 {
            breaker.record_outcome("a:m", Some(&transient()));
        }

        // Advance past the whole window (6 buckets × 10s).
        tokio::time::advance(Duration::from_millis(61_000)).await;
        assert_eq!(breaker.stats("a:m").windowed_failures, 0);

        // One more failure alone must not trip.
        breaker.record_outcome("a:m", Some(&transient()));
        assert!(breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_open_does_not_consume_probe() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        assert!(breaker.is_open("a:m"));

        tokio::time::advance(Duration::from_millis(30_000)).await;
        // Cooldown elapsed: no longer treated as open for skipping, and the
        // check itself admits nothing.
        assert!(!breaker.is_open("a:m"));
        assert!(breaker.can_execute("a:m"));
        assert!(breaker.can_execute("a:m"));
        assert!(!breaker.can_execute("a:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let breaker = CircuitBreaker::new(config());
        trip(&breaker, "a:m");
        assert!(breaker.can_execute("b:m"));
        assert!(!breaker.is_open("b:m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_counts_toward_tripping() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            breaker.record_outcome("a:m", Some(&ErrorCategory::Quota));
        }
        assert!(!breaker.can_execute("a:m"));
    }
}
