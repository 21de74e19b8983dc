//! Configuration management for the admission service.
//!
//! This module handles loading application configuration from environment
//! variables and configuration files, with documented defaults for every
//! tunable.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default())
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.pool_size", 10)?
        .set_default("rate_limit.rate", 100)?
        .set_default("rate_limit.burst", 100)?
        .set_default("rate_limit.window_seconds", 60)?
        .set_default("rate_limit.key_prefix", "gatekeeper:")?
        .set_default("rate_limit.circuit.failure_threshold", 5)?
        .set_default("rate_limit.circuit.recovery_timeout_seconds", 30)?
        .set_default("threat.ddos_threshold", 1000)?
        .set_default("threat.ddos_window_seconds", 60)?
        .set_default("threat.ddos_block_seconds", 600)?
        .set_default("threat.anomaly_threshold", 3.0)?
        .set_default("threat.behavior_threshold", 0.7)?
        .set_default("threat.behavior_window_seconds", 300)?
        .set_default("threat.cleanup_interval_seconds", 60)?
        .set_default("circuit_breaker.failure_threshold", 5)?
        .set_default("circuit_breaker.success_threshold", 2)?
        .set_default("circuit_breaker.timeout_seconds", 30)?
        .set_default("circuit_breaker.half_open_max_calls", 3)?
        .build()?;

    config.try_deserialize()
}
