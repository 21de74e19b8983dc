//! Distributed rate limiting backed by the shared store.
//!
//! Each key maps to a fixed-window counter in the store whose TTL equals the
//! window, so every service instance sees the same count. Spend above the
//! configured rate is tolerated up to a burst ceiling; store outages fail
//! open so a cache incident never takes player traffic down with it. An
//! embedded health circuit stops hammering a store that keeps erroring.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use metrics::counter;
use thiserror::Error;

use crate::core::store::{Store, StoreError};
use crate::models::{HealthCircuitConfig, LimiterConfig};
use crate::utils::format_rate_limit_key;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid rate limiter configuration: {0}")]
    Config(String),
}

const STORE_HEALTHY: u8 = 0;
const STORE_OPEN: u8 = 1;
const STORE_PROBING: u8 = 2;

enum StoreGate {
    /// The store may be called; `probe` marks the single recovery attempt
    Proceed { probe: bool },
    /// The health circuit is open, deny without touching the store
    DenyFast,
}

/// Health circuit over the store connection.
///
/// Distinct from the dependency-facing [`CircuitBreaker`]: it has no
/// half-open call budget, just a single probe after the recovery timeout.
/// While it is open, `allow` denies fast by policy; that is a different
/// condition from a store error on an attempted call, which fails open.
///
/// [`CircuitBreaker`]: crate::core::circuit_breaker::CircuitBreaker
struct HealthCircuit {
    config: HealthCircuitConfig,
    state: AtomicU8,
    failures: AtomicU32,
    opened_at_ms: AtomicU64,
    anchor: Instant,
    transition: Mutex<()>,
}

impl HealthCircuit {
    fn new(config: HealthCircuitConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STORE_HEALTHY),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            anchor: Instant::now(),
            transition: Mutex::new(()),
        }
    }

    fn check(&self) -> StoreGate {
        match self.state.load(Ordering::Acquire) {
            STORE_HEALTHY => StoreGate::Proceed { probe: false },
            STORE_PROBING => StoreGate::DenyFast,
            _ => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                let recovery = self.config.recovery_timeout().as_millis() as u64;
                if self.elapsed_ms().saturating_sub(opened_at) < recovery {
                    return StoreGate::DenyFast;
                }
                let _guard = self.transition.lock().unwrap();
                // Re-check under the lock so only one caller probes
                if self.state.load(Ordering::Acquire) == STORE_OPEN {
                    self.state.store(STORE_PROBING, Ordering::Release);
                    StoreGate::Proceed { probe: true }
                } else {
                    StoreGate::DenyFast
                }
            }
        }
    }

    fn record_success(&self) {
        if self.state.load(Ordering::Acquire) != STORE_HEALTHY
            || self.failures.load(Ordering::Acquire) != 0
        {
            let _guard = self.transition.lock().unwrap();
            self.state.store(STORE_HEALTHY, Ordering::Release);
            self.failures.store(0, Ordering::Release);
        }
    }

    fn record_failure(&self) {
        let _guard = self.transition.lock().unwrap();
        match self.state.load(Ordering::Acquire) {
            STORE_PROBING => {
                // Failed probe, restart the recovery clock
                self.opened_at_ms.store(self.elapsed_ms(), Ordering::Release);
                self.state.store(STORE_OPEN, Ordering::Release);
            }
            STORE_HEALTHY => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.opened_at_ms.store(self.elapsed_ms(), Ordering::Release);
                    self.state.store(STORE_OPEN, Ordering::Release);
                    warn!(
                        "rate limiter store circuit opened after {} consecutive failures",
                        failures
                    );
                }
            }
            _ => {}
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }
}

/// Distributed fixed-window rate limiter
pub struct RateLimiter {
    store: Arc<dyn Store>,
    config: LimiterConfig,
    circuit: Option<HealthCircuit>,
}

impl RateLimiter {
    /// Create a new rate limiter instance.
    ///
    /// Misconfiguration is rejected here so it surfaces at service startup.
    pub fn new(store: Arc<dyn Store>, config: LimiterConfig) -> Result<Self, RateLimitError> {
        if config.rate == 0 {
            return Err(RateLimitError::Config(
                "rate must be greater than zero".to_string(),
            ));
        }
        if config.window_seconds == 0 {
            return Err(RateLimitError::Config(
                "window_seconds must be greater than zero".to_string(),
            ));
        }
        let circuit = config.circuit.clone().map(HealthCircuit::new);
        Ok(Self {
            store,
            config,
            circuit,
        })
    }

    /// Check whether a single request for `key` may proceed.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if the request is within rate or burst, or the store was
    ///   unreachable (fail-open)
    /// * `Ok(false)` if the hard ceiling is exceeded, or the store health
    ///   circuit is open
    pub async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        self.allow_n(key, 1).await
    }

    /// Batched variant of [`allow`](Self::allow), spending `n` units at once
    pub async fn allow_n(&self, key: &str, n: u64) -> Result<bool, RateLimitError> {
        let probe = match self.circuit.as_ref().map(HealthCircuit::check) {
            Some(StoreGate::DenyFast) => {
                counter!("gatekeeper_ratelimit_decisions_total", 1, "result" => "denied_store_circuit");
                return Ok(false);
            }
            Some(StoreGate::Proceed { probe }) => probe,
            None => false,
        };

        let window_key = self.window_key(key);
        let count = match self.store.incr_by(&window_key, n).await {
            Ok(count) => count,
            Err(err) => {
                if let Some(circuit) = &self.circuit {
                    circuit.record_failure();
                }
                warn!(
                    "store unreachable while rate limiting '{}', allowing request: {}",
                    key, err
                );
                counter!("gatekeeper_ratelimit_decisions_total", 1, "result" => "failed_open");
                return Ok(true);
            }
        };
        if let Some(circuit) = &self.circuit {
            circuit.record_success();
        }
        if probe {
            log::info!("rate limiter store circuit closed after successful probe");
        }

        // First increment of the window carries the TTL
        if count == n {
            if let Err(err) = self.store.expire(&window_key, self.config.window()).await {
                if let Some(circuit) = &self.circuit {
                    circuit.record_failure();
                }
                warn!("failed to set window expiry for '{}': {}", key, err);
            }
        }

        if count > self.config.ceiling() {
            counter!("gatekeeper_ratelimit_decisions_total", 1, "result" => "denied");
            return Ok(false);
        }
        if count > self.config.rate {
            warn!(
                "burst allowance spent for '{}': {} of {} (base rate {})",
                key,
                count,
                self.config.ceiling(),
                self.config.rate
            );
        }
        counter!("gatekeeper_ratelimit_decisions_total", 1, "result" => "allowed");
        Ok(true)
    }

    /// Drop the counter for `key`, behaving afterwards like a brand-new key
    pub async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.store.del(&self.window_key(key)).await?;
        Ok(())
    }

    /// Units left below the hard ceiling in the live window, never negative
    pub async fn get_remaining(&self, key: &str) -> Result<u64, RateLimitError> {
        let count = self.current_count(key).await?;
        Ok(self.config.ceiling().saturating_sub(count))
    }

    /// Remaining lifetime of the live window, `None` if no window is open
    pub async fn get_ttl(&self, key: &str) -> Result<Option<Duration>, RateLimitError> {
        Ok(self.store.ttl(&self.window_key(key)).await?)
    }

    /// Whether `key` has already spent past the hard ceiling
    pub async fn is_blocked(&self, key: &str) -> Result<bool, RateLimitError> {
        let count = self.current_count(key).await?;
        Ok(count > self.config.ceiling())
    }

    /// Steady-state rate per window
    pub fn rate(&self) -> u64 {
        self.config.rate
    }

    /// Window duration
    pub fn window(&self) -> Duration {
        self.config.window()
    }

    async fn current_count(&self, key: &str) -> Result<u64, RateLimitError> {
        let value = self.store.get(&self.window_key(key)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    fn window_key(&self, key: &str) -> String {
        format_rate_limit_key(&self.config.key_prefix, key)
    }
}

/// Logical-AND composition of several rate limiters.
///
/// A constituent that errors is logged and skipped rather than failing the
/// whole check, trading strictness for availability.
pub struct MultiLimiter {
    limiters: Vec<Arc<RateLimiter>>,
}

impl MultiLimiter {
    pub fn new(limiters: Vec<Arc<RateLimiter>>) -> Self {
        Self { limiters }
    }

    /// Allowed only if every constituent allows.
    ///
    /// Every constituent is consulted even after a denial so each window
    /// counter stays accurate.
    pub async fn allow(&self, key: &str) -> bool {
        let mut allowed = true;
        for limiter in &self.limiters {
            match limiter.allow(key).await {
                Ok(true) => {}
                Ok(false) => allowed = false,
                Err(err) => {
                    warn!("limiter error for '{}', skipping limiter: {}", key, err);
                }
            }
        }
        allowed
    }

    /// Minimum remaining across constituents; `None` if none could answer
    pub async fn get_remaining(&self, key: &str) -> Option<u64> {
        let mut min: Option<u64> = None;
        for limiter in &self.limiters {
            if let Ok(remaining) = limiter.get_remaining(key).await {
                min = Some(min.map_or(remaining, |m| m.min(remaining)));
            }
        }
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::testing::InMemoryStore;
    use crate::core::store::MockStore;

    fn limiter_config(rate: u64, burst: u64, window_seconds: u64) -> LimiterConfig {
        LimiterConfig {
            rate,
            burst,
            window_seconds,
            key_prefix: "test:".to_string(),
            circuit: None,
        }
    }

    fn limiter(store: Arc<InMemoryStore>, config: LimiterConfig) -> RateLimiter {
        RateLimiter::new(store, config).unwrap()
    }

    #[tokio::test]
    async fn denies_only_above_the_hard_ceiling() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, limiter_config(5, 2, 60));

        // Base rate
        for _ in 0..5 {
            assert!(limiter.allow("player-1").await.unwrap());
        }
        // Burst spend is still allowed
        assert!(limiter.allow("player-1").await.unwrap());
        assert!(limiter.allow("player-1").await.unwrap());
        // Above rate + burst
        assert!(!limiter.allow("player-1").await.unwrap());

        assert!(limiter.is_blocked("player-1").await.unwrap());
        assert_eq!(limiter.get_remaining("player-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, limiter_config(2, 0, 1));

        assert!(limiter.allow("player-2").await.unwrap());
        assert!(limiter.allow("player-2").await.unwrap());
        assert!(!limiter.allow("player-2").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(limiter.allow("player-2").await.unwrap());
    }

    #[tokio::test]
    async fn keys_are_tracked_independently() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, limiter_config(1, 0, 60));

        assert!(limiter.allow("a").await.unwrap());
        assert!(!limiter.allow("a").await.unwrap());
        assert!(limiter.allow("b").await.unwrap());
    }

    #[tokio::test]
    async fn reset_behaves_like_a_new_key() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, limiter_config(2, 0, 60));

        assert!(limiter.allow("player-3").await.unwrap());
        assert!(limiter.allow("player-3").await.unwrap());
        assert!(!limiter.allow("player-3").await.unwrap());

        limiter.reset("player-3").await.unwrap();

        assert!(limiter.allow("player-3").await.unwrap());
        assert_eq!(limiter.get_remaining("player-3").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn allow_n_spends_the_window_in_batches() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, limiter_config(5, 0, 60));

        assert!(limiter.allow_n("batch", 3).await.unwrap());
        assert!(limiter.allow_n("batch", 2).await.unwrap());
        assert!(!limiter.allow_n("batch", 1).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_matches_the_window() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, limiter_config(10, 0, 60));

        assert_eq!(limiter.get_ttl("fresh").await.unwrap(), None);
        limiter.allow("fresh").await.unwrap();
        let ttl = limiter.get_ttl("fresh").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(58));
    }

    #[tokio::test]
    async fn store_errors_fail_open() {
        let mut store = MockStore::new();
        store
            .expect_incr_by()
            .returning(|_, _| Err(StoreError::Other("connection refused".to_string())));

        let limiter = RateLimiter::new(Arc::new(store), limiter_config(1, 0, 60)).unwrap();

        // Denial would require a store answer; an unreachable store allows
        assert!(limiter.allow("player-4").await.unwrap());
        assert!(limiter.allow("player-4").await.unwrap());
    }

    #[tokio::test]
    async fn open_health_circuit_denies_without_touching_the_store() {
        let mut store = MockStore::new();
        // Exactly two store calls: the two failures that open the circuit
        store
            .expect_incr_by()
            .times(2)
            .returning(|_, _| Err(StoreError::Other("connection refused".to_string())));

        let config = LimiterConfig {
            circuit: Some(HealthCircuitConfig {
                failure_threshold: 2,
                recovery_timeout_seconds: 60,
            }),
            ..limiter_config(10, 0, 60)
        };
        let limiter = RateLimiter::new(Arc::new(store), config).unwrap();

        // Store errors fail open while the circuit accumulates failures
        assert!(limiter.allow("k").await.unwrap());
        assert!(limiter.allow("k").await.unwrap());
        // Circuit is now open: deny fast, no further store calls
        assert!(!limiter.allow("k").await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());
    }

    #[tokio::test]
    async fn probe_closes_the_circuit_after_recovery() {
        let store = Arc::new(InMemoryStore::new());
        let config = LimiterConfig {
            circuit: Some(HealthCircuitConfig {
                failure_threshold: 2,
                recovery_timeout_seconds: 1,
            }),
            ..limiter_config(10, 0, 60)
        };
        let limiter = RateLimiter::new(store.clone(), config).unwrap();

        store.set_failing(true);
        assert!(limiter.allow("k").await.unwrap());
        assert!(limiter.allow("k").await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());

        store.set_failing(false);
        // Still inside the recovery timeout
        assert!(!limiter.allow("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // The probe succeeds and the circuit closes again
        assert!(limiter.allow("k").await.unwrap());
        assert!(limiter.allow("k").await.unwrap());
    }

    #[tokio::test]
    async fn failed_probe_keeps_the_circuit_open_but_fails_open() {
        let store = Arc::new(InMemoryStore::new());
        let config = LimiterConfig {
            circuit: Some(HealthCircuitConfig {
                failure_threshold: 1,
                recovery_timeout_seconds: 1,
            }),
            ..limiter_config(10, 0, 60)
        };
        let limiter = RateLimiter::new(store.clone(), config).unwrap();

        store.set_failing(true);
        assert!(limiter.allow("k").await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // The probe reaches the store and errors: the probed request itself
        // fails open, but the circuit stays open for everyone after it
        assert!(limiter.allow("k").await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());
    }

    #[tokio::test]
    async fn zero_rate_is_rejected_at_construction() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let result = RateLimiter::new(store, limiter_config(0, 0, 60));
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[tokio::test]
    async fn multi_limiter_is_a_logical_and() {
        let store = Arc::new(InMemoryStore::new());
        let strict = Arc::new(limiter(
            Arc::clone(&store),
            LimiterConfig {
                key_prefix: "strict:".to_string(),
                ..limiter_config(1, 0, 60)
            },
        ));
        let loose = Arc::new(limiter(
            Arc::clone(&store),
            LimiterConfig {
                key_prefix: "loose:".to_string(),
                ..limiter_config(100, 0, 60)
            },
        ));
        let multi = MultiLimiter::new(vec![strict, loose]);

        assert!(multi.allow("player-5").await);
        // The strict limiter denies, so the composition denies
        assert!(!multi.allow("player-5").await);
        assert_eq!(multi.get_remaining("player-5").await, Some(0));
    }
}
