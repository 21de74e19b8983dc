use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::circuit_breaker::CircuitBreakerConfig;

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per window before burst spend begins
    pub rate: u64,
    /// Extra requests tolerated above `rate` before hard denial
    pub burst: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Prefix for store keys, e.g. "gatekeeper:"
    pub key_prefix: String,
    /// Health circuit guarding the store itself; `None` disables it
    pub circuit: Option<HealthCircuitConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 100,
            burst: 100,
            window_seconds: 60,
            key_prefix: "gatekeeper:".to_string(),
            circuit: Some(HealthCircuitConfig::default()),
        }
    }
}

impl LimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Hard ceiling above which requests are denied
    pub fn ceiling(&self) -> u64 {
        self.rate + self.burst
    }
}

/// Health circuit settings embedded in the rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCircuitConfig {
    /// Store failures tolerated before the circuit opens
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a recovery probe
    pub recovery_timeout_seconds: u64,
}

impl Default for HealthCircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
        }
    }
}

impl HealthCircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

/// Threat detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatConfig {
    /// Requests from one IP within the DDoS window that trigger a block
    pub ddos_threshold: u64,
    /// DDoS counting window in seconds
    pub ddos_window_seconds: u64,
    /// How long a triggering IP stays blocked, in seconds
    pub ddos_block_seconds: u64,
    /// Z-score above which a latency sample is anomalous
    pub anomaly_threshold: f64,
    /// Composite suspicion score above which a user is flagged
    pub behavior_threshold: f64,
    /// Idle window after which a user's behavior pattern is evicted, in seconds
    pub behavior_window_seconds: u64,
    /// Interval of the background cleanup sweep, in seconds
    pub cleanup_interval_seconds: u64,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            ddos_threshold: 1000,
            ddos_window_seconds: 60,
            ddos_block_seconds: 600,
            anomaly_threshold: 3.0,
            behavior_threshold: 0.7,
            behavior_window_seconds: 300,
            cleanup_interval_seconds: 60,
        }
    }
}

impl ThreatConfig {
    pub fn ddos_window(&self) -> Duration {
        Duration::from_secs(self.ddos_window_seconds)
    }

    pub fn ddos_block_duration(&self) -> Duration {
        Duration::from_secs(self.ddos_block_seconds)
    }

    pub fn behavior_window(&self) -> Duration {
        Duration::from_secs(self.behavior_window_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Circuit breaker defaults for outbound dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open a circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close a circuit
    pub success_threshold: u32,
    /// Seconds an open circuit waits before probing
    pub timeout_seconds: u64,
    /// Calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 30,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerSettings {
    /// Expand into the full breaker configuration
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_seconds),
            half_open_max_calls: self.half_open_max_calls,
            on_state_change: None,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Redis connection pool size
    pub pool_size: u32,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Rate limiter configuration
    pub rate_limit: LimiterConfig,
    /// Threat detector configuration
    pub threat: ThreatConfig,
    /// Circuit breaker defaults
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                pool_size: 10,
            },
            rate_limit: LimiterConfig::default(),
            threat: ThreatConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_ceiling_is_rate_plus_burst() {
        let config = LimiterConfig {
            rate: 5,
            burst: 2,
            ..LimiterConfig::default()
        };
        assert_eq!(config.ceiling(), 7);
        assert_eq!(config.window(), Duration::from_secs(60));
    }

    #[test]
    fn breaker_settings_expand_to_core_config() {
        let settings = CircuitBreakerSettings::default();
        let config = settings.to_config();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.half_open_max_calls, 3);
        assert!(config.on_state_change.is_none());
    }
}
