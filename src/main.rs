//! Gatekeeper admission service.
//!
//! This is the main entry point for the standalone admission gateway.
//! It loads configuration, connects the shared store, installs the
//! Prometheus exporter, and starts the web server with the admission
//! middleware in front of the admin API.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;

use gatekeeper::api::{self, ApiState};
use gatekeeper::core::circuit_breaker::CircuitBreakerRegistry;
use gatekeeper::core::rate_limiter::RateLimiter;
use gatekeeper::core::store::{RedisStore, Store};
use gatekeeper::core::threat_detector::ThreatDetector;
use gatekeeper::middleware::RateLimit;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting gatekeeper admission service...");

    // Load configuration
    let config = gatekeeper::config::load_config().context("failed to load configuration")?;

    // Expose Prometheus metrics
    PrometheusBuilder::new()
        .install()
        .context("failed to install Prometheus metrics exporter")?;

    // Initialize the shared store
    let client = Client::open(config.redis.url.as_str()).context("failed to create Redis client")?;
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(client));

    // Initialize the admission components
    let limiter = Arc::new(
        RateLimiter::new(Arc::clone(&store), config.rate_limit.clone())
            .context("invalid rate limiter configuration")?,
    );
    let detector = Arc::new(
        ThreatDetector::new(Arc::clone(&store), config.threat.clone())
            .context("invalid threat detector configuration")?,
    );
    let circuits = Arc::new(CircuitBreakerRegistry::new());

    // Create API state
    let state = web::Data::new(ApiState {
        limiter: Arc::clone(&limiter),
        detector,
        circuits,
    });

    // Start HTTP server
    info!(
        "listening on {}:{}",
        config.server.host, config.server.port
    );
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(RateLimit::new(Arc::clone(&limiter)))
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
