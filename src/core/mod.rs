//! Core admission-control components.
//!
//! This module contains the resilience and security building blocks shared
//! by the game backend services: the circuit breaker, the distributed rate
//! limiter, the threat detector, and the store they coordinate through.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod store;
pub mod threat_detector;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use rate_limiter::{MultiLimiter, RateLimiter};
pub use store::{RedisStore, Store};
pub use threat_detector::{Threat, ThreatDetector, ThreatLevel, ThreatType};
