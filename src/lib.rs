//! Gatekeeper
//!
//! Shared resilience and security middleware for the game backend services:
//! a per-dependency circuit breaker, a Redis-coordinated rate limiter, a
//! threat detector, and an actix-web admission middleware that gates
//! inbound requests. Services embed these components directly; the binary
//! in this crate runs them as a standalone admission gateway.

pub mod api;
pub mod config;
pub mod core;
pub mod middleware;
pub mod models;
pub mod utils;

pub use crate::core::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use crate::core::rate_limiter::{MultiLimiter, RateLimiter};
pub use crate::core::store::{RedisStore, Store};
pub use crate::core::threat_detector::{Threat, ThreatDetector, ThreatLevel, ThreatType};
pub use crate::middleware::{KeyStrategy, RateLimit};
pub use crate::models::Config;
