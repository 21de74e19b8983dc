//! Circuit breaker for outbound dependencies.
//!
//! A per-dependency Closed/Open/HalfOpen state machine: after enough
//! consecutive failures the circuit opens and calls fail fast; once the
//! timeout elapses a bounded number of half-open probes decide whether the
//! dependency has recovered. The read path is lock-free; only state
//! transitions take a short mutex, re-checking the state after acquisition
//! so concurrent callers cannot double-transition.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Errors that can occur constructing a circuit breaker
#[derive(Error, Debug)]
pub enum CircuitBreakerError {
    #[error("Invalid circuit breaker configuration: {0}")]
    Config(String),
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Error, Debug)]
pub enum ExecuteError<E>
where
    E: fmt::Debug + fmt::Display,
{
    /// The circuit denied the call by policy; the wrapped function never ran.
    #[error("Circuit breaker is open")]
    Rejected,
    /// The wrapped function ran and failed.
    #[error("{0}")]
    Call(E),
}

impl<E> ExecuteError<E>
where
    E: fmt::Debug + fmt::Display,
{
    pub fn is_rejected(&self) -> bool {
        matches!(self, ExecuteError::Rejected)
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = STATE_CLOSED as isize,
    Open = STATE_OPEN as isize,
    HalfOpen = STATE_HALF_OPEN as isize,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Callback invoked on every state transition with (from, to)
pub type StateChangeHook = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker configuration
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Maximum calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Optional state transition hook
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("timeout", &self.timeout)
            .field("half_open_max_calls", &self.half_open_max_calls)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::Config(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::Config(
                "success_threshold must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(CircuitBreakerError::Config(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(CircuitBreakerError::Config(
                "half_open_max_calls must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of a circuit breaker's lifetime counters
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub state_changes: u64,
    pub consecutive_failures: u32,
    /// Milliseconds since the most recent failure, `None` before any failure
    pub last_failure_age_ms: Option<u64>,
}

/// Per-dependency circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_calls: AtomicU32,
    half_open_successes: AtomicU32,
    /// Millis since `anchor` at which the circuit last opened
    opened_at_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    state_changes: AtomicU64,
    anchor: Instant,
    transition: Mutex<()>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named dependency.
    ///
    /// Configuration is validated here so a misconfigured breaker fails at
    /// service startup rather than under traffic.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
            anchor: Instant::now(),
            transition: Mutex::new(()),
        })
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        // The default configuration is statically valid
        Self::new(name, CircuitBreakerConfig::default()).unwrap()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decide whether a call may proceed.
    ///
    /// Closed and Open-before-timeout are answered from atomic loads alone.
    /// The Open-to-HalfOpen transition races through the transition lock,
    /// and the winner consumes the first half-open slot.
    pub fn allow(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_CLOSED => return true,
                STATE_HALF_OPEN => return self.admit_half_open(),
                _ => {
                    let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                    if self.elapsed_ms().saturating_sub(opened_at) < self.timeout_ms() {
                        metrics::counter!(
                            "gatekeeper_circuit_rejections_total", 1,
                            "circuit" => self.name.clone()
                        );
                        return false;
                    }
                    let guard = self.transition.lock().unwrap();
                    // Re-check under the lock: another caller may have won
                    // the transition, or the circuit may have reopened
                    let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                    if self.state.load(Ordering::Acquire) == STATE_OPEN
                        && self.elapsed_ms().saturating_sub(opened_at) >= self.timeout_ms()
                    {
                        self.transition_locked(CircuitState::Open, CircuitState::HalfOpen);
                        self.half_open_calls.store(1, Ordering::Release);
                        return true;
                    }
                    drop(guard);
                }
            }
        }
    }

    fn admit_half_open(&self) -> bool {
        let max = self.config.half_open_max_calls;
        let admitted = self
            .half_open_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |calls| {
                (calls < max).then_some(calls + 1)
            })
            .is_ok();
        if !admitted {
            metrics::counter!(
                "gatekeeper_circuit_rejections_total", 1,
                "circuit" => self.name.clone()
            );
        }
        admitted
    }

    /// Record a successful call outcome
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    let _guard = self.transition.lock().unwrap();
                    if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
                        self.transition_locked(CircuitState::HalfOpen, CircuitState::Closed);
                    }
                }
            }
            _ => {}
        }
    }

    /// Record a failed call outcome
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(self.elapsed_ms(), Ordering::Release);
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    let _guard = self.transition.lock().unwrap();
                    if self.state.load(Ordering::Acquire) == STATE_CLOSED
                        && self.consecutive_failures.load(Ordering::Acquire)
                            >= self.config.failure_threshold
                    {
                        self.transition_locked(CircuitState::Closed, CircuitState::Open);
                    }
                }
            }
            STATE_HALF_OPEN => {
                // Any half-open failure reopens the circuit
                let _guard = self.transition.lock().unwrap();
                if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
                    self.transition_locked(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`ExecuteError::Rejected`] without invoking `f` when the
    /// circuit denies the call; otherwise records the outcome of `f`.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        if !self.allow() {
            return Err(ExecuteError::Rejected);
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(ExecuteError::Call(err))
            }
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Snapshot of lifetime counters
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let last_failure = self.last_failure_ms.load(Ordering::Acquire);
        CircuitBreakerMetrics {
            state: self.state(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_failure_age_ms: (self.total_failures.load(Ordering::Relaxed) > 0)
                .then(|| self.elapsed_ms().saturating_sub(last_failure)),
        }
    }

    /// Force the breaker back to Closed with all counters cleared
    pub fn reset(&self) {
        let _guard = self.transition.lock().unwrap();
        let from = self.state();
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        if from != CircuitState::Closed {
            self.state_changes.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = &self.config.on_state_change {
                hook(from, CircuitState::Closed);
            }
        }
    }

    /// Apply a transition while holding the transition lock
    fn transition_locked(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                self.opened_at_ms.store(self.elapsed_ms(), Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.half_open_calls.store(0, Ordering::Release);
                self.half_open_successes.store(0, Ordering::Release);
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.half_open_calls.store(0, Ordering::Release);
                self.half_open_successes.store(0, Ordering::Release);
            }
        }
        self.state.store(to as u8, Ordering::Release);
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        log::info!("circuit '{}' transitioned {:?} -> {:?}", self.name, from, to);
        if let Some(hook) = &self.config.on_state_change {
            hook(from, to);
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    fn timeout_ms(&self) -> u64 {
        self.config.timeout.as_millis() as u64
    }
}

/// Registry of per-destination circuit breakers.
///
/// Services wrap every outbound dependency in its own breaker; the registry
/// hands out one shared instance per destination name.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<std::collections::HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Fetch the breaker for `name`, creating it with `config` if absent
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, CircuitBreakerError> {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(breaker) = breakers.get(name) {
            return Ok(Arc::clone(breaker));
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config)?);
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        Ok(breaker)
    }

    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.lock().unwrap().values().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().unwrap().remove(name)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
