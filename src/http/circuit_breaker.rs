use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, Result, RollgateError};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MONITORING_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside the monitoring window that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is let through.
    pub recovery_timeout: Duration,
    pub monitoring_window: Duration,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            monitoring_window: DEFAULT_MONITORING_WINDOW,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

/// A state transition, delivered to observers after the breaker's lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
}

pub type StateChangeCallback = Arc<dyn Fn(StateChange) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Failures currently inside the monitoring window.
    pub recent_failures: usize,
    pub half_open_successes: u32,
    #[serde(skip)]
    pub opened_at: Option<Instant>,
}

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<StateChange> {
        let from = self.state;
        if from == to {
            return None;
        }

        self.state = to;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = 0;
            }
            CircuitState::Closed => {
                self.failures.clear();
                self.opened_at = None;
                self.half_open_successes = 0;
            }
        }
        Some(StateChange { from, to })
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Gates remote calls after repeated failures.
///
/// All state lives behind one lock. Open moves to HalfOpen lazily, when a
/// caller asks to run an operation after the recovery timeout; no timer is
/// involved.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    listeners: RwLock<Vec<StateChangeCallback>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register an observer for state transitions.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(callback));
    }

    fn notify(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        tracing::info!("Circuit breaker {} -> {}", change.from, change.to);
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(change);
        }
    }

    /// Current state, without applying the lazy Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Whether a call made now would be let through. Read-only.
    pub fn is_allowing_requests(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.recovery_elapsed(&inner, Instant::now()),
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerState, now: Instant) -> bool {
        inner
            .opened_at
            .map_or(true, |opened| now.duration_since(opened) >= self.config.recovery_timeout)
    }

    /// Decide whether an operation may run, moving Open to HalfOpen once the
    /// recovery timeout has passed. Check and transition are one step.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let (allowed, change) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (true, None),
                CircuitState::Open if self.recovery_elapsed(&inner, now) => {
                    (true, inner.transition(CircuitState::HalfOpen, now))
                }
                CircuitState::Open => (false, None),
            }
        };
        self.notify(change);
        allowed
    }

    pub fn record_success(&self) {
        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        inner.transition(CircuitState::Closed, Instant::now())
                    } else {
                        None
                    }
                }
                CircuitState::Closed | CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let change = {
            let mut inner = self.inner.lock();
            inner.failures.push_back(now);
            inner.prune(now, self.config.monitoring_window);
            match inner.state {
                CircuitState::HalfOpen => inner.transition(CircuitState::Open, now),
                CircuitState::Closed => {
                    if inner.failures.len() >= self.config.failure_threshold as usize {
                        inner.transition(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    /// Run `action` through the breaker. Rejected calls never invoke it.
    pub async fn execute<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire() {
            return Err(RollgateError::circuit_open());
        }

        match action().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.code != ErrorCode::CircuitOpen {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Open the circuit regardless of recent history.
    pub fn force_open(&self) {
        let change = self.inner.lock().transition(CircuitState::Open, Instant::now());
        self.notify(change);
    }

    /// Close the circuit and forget all recorded failures.
    pub fn force_reset(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let change = inner.transition(CircuitState::Closed, Instant::now());
            inner.failures.clear();
            inner.opened_at = None;
            inner.half_open_successes = 0;
            change
        };
        self.notify(change);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.monitoring_window);
        CircuitBreakerStats {
            state: inner.state,
            recent_failures: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            opened_at: inner.opened_at,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            success_threshold: 1,
            ..Default::default()
        })
    }

    #[test]
    fn test_state_read_does_not_transition() {
        let breaker = breaker(1, Duration::ZERO);
        breaker.record_failure();

        assert!(breaker.is_open());
        assert!(breaker.is_allowing_requests());
        assert!(breaker.is_open());

        assert!(breaker.try_acquire());
        assert!(breaker.is_half_open());
    }

    #[test]
    fn test_failures_outside_window_are_pruned() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            monitoring_window: Duration::from_millis(20),
            ..Default::default()
        });

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.record_failure();

        assert!(breaker.is_closed());
        assert_eq!(breaker.stats().recent_failures, 1);
    }

    #[test]
    fn test_success_while_closed_keeps_failures() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert!(breaker.is_open());
    }
}
