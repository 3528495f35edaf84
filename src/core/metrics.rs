//! In-process counters describing how the SDK is behaving.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ErrorCategory;
use crate::http::CircuitState;

/// Latency samples kept for percentile estimates.
pub const MAX_LATENCY_SAMPLES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,

    /// Latencies in milliseconds over the retained samples.
    pub average_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stale_hits: u64,
    pub cache_hit_rate: f64,

    pub circuit_state: CircuitState,
    pub circuit_open_count: u64,
    pub circuit_half_open_count: u64,
    pub circuit_close_count: u64,

    pub total_evaluations: u64,

    pub network_errors: u64,
    pub auth_errors: u64,
    pub rate_limit_errors: u64,
    pub server_errors: u64,
    pub other_errors: u64,
}

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

struct CircuitCounts {
    state: CircuitState,
    opened: u64,
    half_opened: u64,
    closed: u64,
}

pub struct SdkMetrics {
    total_requests: Counter,
    successful_requests: Counter,
    failed_requests: Counter,
    latencies: Mutex<VecDeque<u64>>,

    cache_hits: Counter,
    cache_misses: Counter,
    cache_stale_hits: Counter,

    circuit: Mutex<CircuitCounts>,

    total_evaluations: Counter,

    network_errors: Counter,
    auth_errors: Counter,
    rate_limit_errors: Counter,
    server_errors: Counter,
    other_errors: Counter,
}

impl SdkMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: Counter::default(),
            successful_requests: Counter::default(),
            failed_requests: Counter::default(),
            latencies: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            cache_stale_hits: Counter::default(),
            circuit: Mutex::new(CircuitCounts {
                state: CircuitState::Closed,
                opened: 0,
                half_opened: 0,
                closed: 0,
            }),
            total_evaluations: Counter::default(),
            network_errors: Counter::default(),
            auth_errors: Counter::default(),
            rate_limit_errors: Counter::default(),
            server_errors: Counter::default(),
            other_errors: Counter::default(),
        }
    }

    /// Record a finished request. `error` is the failure category, if any.
    pub fn record_request(&self, latency: Duration, error: Option<ErrorCategory>) {
        self.total_requests.incr();
        match error {
            None => self.successful_requests.incr(),
            Some(category) => {
                self.failed_requests.incr();
                match category {
                    ErrorCategory::Network => self.network_errors.incr(),
                    ErrorCategory::Auth => self.auth_errors.incr(),
                    ErrorCategory::RateLimit => self.rate_limit_errors.incr(),
                    ErrorCategory::Server => self.server_errors.incr(),
                    ErrorCategory::Validation
                    | ErrorCategory::CircuitOpen
                    | ErrorCategory::Unknown => self.other_errors.incr(),
                }
            }
        }

        let mut latencies = self.latencies.lock();
        if latencies.len() == MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
        latencies.push_back(latency.as_millis() as u64);
    }

    pub fn record_cache_hit(&self, stale: bool) {
        if stale {
            self.cache_stale_hits.incr();
        } else {
            self.cache_hits.incr();
        }
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.incr();
    }

    pub fn record_circuit_state(&self, state: CircuitState) {
        let mut circuit = self.circuit.lock();
        circuit.state = state;
        match state {
            CircuitState::Open => circuit.opened += 1,
            CircuitState::HalfOpen => circuit.half_opened += 1,
            CircuitState::Closed => circuit.closed += 1,
        }
    }

    pub fn record_evaluation(&self) {
        self.total_evaluations.incr();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (min, max, avg, p50, p95, p99) = {
            let latencies = self.latencies.lock();
            let mut sorted: Vec<u64> = latencies.iter().copied().collect();
            sorted.sort_unstable();
            let avg = if sorted.is_empty() {
                0.0
            } else {
                sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
            };
            (
                sorted.first().copied().unwrap_or(0),
                sorted.last().copied().unwrap_or(0),
                avg,
                percentile(&sorted, 50),
                percentile(&sorted, 95),
                percentile(&sorted, 99),
            )
        };

        let (circuit_state, opened, half_opened, closed) = {
            let circuit = self.circuit.lock();
            (circuit.state, circuit.opened, circuit.half_opened, circuit.closed)
        };

        let cache_hits = self.cache_hits.get();
        let cache_misses = self.cache_misses.get();
        let cache_stale_hits = self.cache_stale_hits.get();
        let cache_total = cache_hits + cache_misses + cache_stale_hits;
        let cache_hit_rate = if cache_total == 0 {
            0.0
        } else {
            (cache_hits + cache_stale_hits) as f64 / cache_total as f64
        };

        MetricsSnapshot {
            total_requests: self.total_requests.get(),
            successful_requests: self.successful_requests.get(),
            failed_requests: self.failed_requests.get(),
            average_latency_ms: avg,
            min_latency_ms: min,
            max_latency_ms: max,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            cache_hits,
            cache_misses,
            cache_stale_hits,
            cache_hit_rate,
            circuit_state,
            circuit_open_count: opened,
            circuit_half_open_count: half_opened,
            circuit_close_count: closed,
            total_evaluations: self.total_evaluations.get(),
            network_errors: self.network_errors.get(),
            auth_errors: self.auth_errors.get(),
            rate_limit_errors: self.rate_limit_errors.get(),
            server_errors: self.server_errors.get(),
            other_errors: self.other_errors.get(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.successful_requests,
            &self.failed_requests,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_stale_hits,
            &self.total_evaluations,
            &self.network_errors,
            &self.auth_errors,
            &self.rate_limit_errors,
            &self.server_errors,
            &self.other_errors,
        ] {
            counter.reset();
        }
        self.latencies.lock().clear();
        let mut circuit = self.circuit.lock();
        circuit.opened = 0;
        circuit.half_opened = 0;
        circuit.closed = 0;
    }
}

impl Default for SdkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = (p * sorted.len() / 100).min(sorted.len() - 1);
    sorted[idx]
}
