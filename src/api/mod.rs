//! Admin and ops endpoints for the admission service.
//!
//! These sit behind the admission middleware and expose health, explicit
//! rate-limit checks for non-HTTP callers, threat statistics, block
//! lookups, and the state of registered circuit breakers.

use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::circuit_breaker::{CircuitBreakerMetrics, CircuitBreakerRegistry};
use crate::core::rate_limiter::RateLimiter;
use crate::core::threat_detector::ThreatDetector;

pub struct ApiState {
    pub limiter: Arc<RateLimiter>,
    pub detector: Arc<ThreatDetector>,
    pub circuits: Arc<CircuitBreakerRegistry>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/rate-limit").route(web::post().to(check_rate_limit)))
            .service(web::resource("/rate-limit/reset").route(web::post().to(reset_rate_limit)))
            .service(web::resource("/threats/stats").route(web::get().to(threat_stats)))
            .service(web::resource("/threats/blocked/{ip}").route(web::get().to(blocked_status)))
            .service(web::resource("/circuits").route(web::get().to(list_circuits))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Rate limit check request
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitRequest {
    pub key: String,
}

/// Rate limit check response
#[derive(Serialize)]
struct RateLimitResponse {
    allowed: bool,
    remaining: u64,
    message: String,
}

#[derive(Serialize)]
struct BlockedResponse {
    ip: String,
    blocked: bool,
}

#[derive(Serialize)]
struct CircuitSummary {
    name: String,
    metrics: CircuitBreakerMetrics,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Explicit rate limit check for callers outside the HTTP middleware
pub async fn check_rate_limit(
    state: web::Data<ApiState>,
    req: web::Json<RateLimitRequest>,
) -> impl Responder {
    let allowed = state.limiter.allow(&req.key).await.unwrap_or(true);
    let remaining = state.limiter.get_remaining(&req.key).await.unwrap_or(0);
    if allowed {
        HttpResponse::Ok().json(RateLimitResponse {
            allowed: true,
            remaining,
            message: "Request allowed".to_string(),
        })
    } else {
        HttpResponse::TooManyRequests().json(RateLimitResponse {
            allowed: false,
            remaining,
            message: "Rate limit exceeded".to_string(),
        })
    }
}

/// Reset the window for a key
async fn reset_rate_limit(
    state: web::Data<ApiState>,
    req: web::Json<RateLimitRequest>,
) -> impl Responder {
    match state.limiter.reset(&req.key).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "reset_failed",
            "message": err.to_string(),
        })),
    }
}

/// Lifetime threat detection counters
async fn threat_stats(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.detector.threat_stats())
}

/// Whether an IP is currently blocked
async fn blocked_status(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let ip = path.into_inner();
    let blocked = state.detector.is_blocked(&ip).await.unwrap_or(false);
    HttpResponse::Ok().json(BlockedResponse { ip, blocked })
}

/// State of every registered circuit breaker
async fn list_circuits(state: web::Data<ApiState>) -> impl Responder {
    let circuits: Vec<CircuitSummary> = state
        .circuits
        .get_all()
        .into_iter()
        .map(|breaker| CircuitSummary {
            name: breaker.name().to_string(),
            metrics: breaker.metrics(),
        })
        .collect();
    HttpResponse::Ok().json(circuits)
}
