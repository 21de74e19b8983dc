//! Admission middleware for HTTP ingress.
//!
//! A thin gate in front of the handlers: derive a rate-limit key from the
//! request, ask the distributed rate limiter, attach `X-RateLimit-*`
//! headers, and short-circuit denied requests through a pluggable rejection
//! handler. All policy lives in the limiter; this layer only adapts it to
//! HTTP.

use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::{Error, HttpResponse};
use futures::future::LocalBoxFuture;
use log::warn;
use serde_json::json;

use crate::core::rate_limiter::RateLimiter;
use crate::utils::get_current_timestamp;

/// Builds the HTTP response for a denied request
pub type DenialHandler = dyn Fn() -> HttpResponse + Send + Sync;

/// How the rate-limit key is derived from a request
#[derive(Clone)]
pub enum KeyStrategy {
    /// Client IP: `X-Forwarded-For`, then `X-Real-IP`, then the peer address
    ClientIp,
    /// A request header (e.g. an authenticated user id), falling back to
    /// the client IP when absent
    Header(String),
    /// The request path, scoping the limit per route
    Path,
    /// Caller-supplied derivation
    Custom(Arc<dyn Fn(&ServiceRequest) -> String + Send + Sync>),
}

/// Admission middleware factory
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    strategy: KeyStrategy,
    expose_headers: bool,
    denial: Arc<DenialHandler>,
}

impl RateLimit {
    /// Gate requests on `limiter`, keyed by client IP, with headers enabled
    /// and the default 429 JSON denial response
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            strategy: KeyStrategy::ClientIp,
            expose_headers: true,
            denial: Arc::new(default_denial),
        }
    }

    pub fn with_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_headers(mut self, expose: bool) -> Self {
        self.expose_headers = expose;
        self
    }

    pub fn with_denial_handler(
        mut self,
        handler: impl Fn() -> HttpResponse + Send + Sync + 'static,
    ) -> Self {
        self.denial = Arc::new(handler);
        self
    }
}

fn default_denial() -> HttpResponse {
    HttpResponse::TooManyRequests().json(json!({
        "error": "rate_limit_exceeded",
        "message": "Too many requests",
    }))
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddleware {
            service: Rc::new(service),
            limiter: Arc::clone(&self.limiter),
            strategy: self.strategy.clone(),
            expose_headers: self.expose_headers,
            denial: Arc::clone(&self.denial),
        }))
    }
}

/// Admission middleware service
pub struct RateLimitMiddleware<S> {
    service: Rc<S>,
    limiter: Arc<RateLimiter>,
    strategy: KeyStrategy,
    expose_headers: bool,
    denial: Arc<DenialHandler>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let limiter = Arc::clone(&self.limiter);
        let strategy = self.strategy.clone();
        let expose_headers = self.expose_headers;
        let denial = Arc::clone(&self.denial);

        Box::pin(async move {
            let key = derive_key(&strategy, &req);
            let allowed = match limiter.allow(&key).await {
                Ok(allowed) => allowed,
                Err(err) => {
                    warn!("rate limit check failed for '{}', allowing request: {}", key, err);
                    true
                }
            };

            let window = if expose_headers {
                Some(window_status(&limiter, &key).await)
            } else {
                None
            };

            if !allowed {
                let mut response = denial();
                if let Some(window) = &window {
                    apply_headers(response.headers_mut(), window);
                }
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut res = service.call(req).await?;
            if let Some(window) = &window {
                apply_headers(res.headers_mut(), window);
            }
            Ok(res.map_into_left_body())
        })
    }
}

struct WindowStatus {
    limit: u64,
    remaining: u64,
    reset: u64,
}

async fn window_status(limiter: &RateLimiter, key: &str) -> WindowStatus {
    let remaining = limiter.get_remaining(key).await.unwrap_or(limiter.rate());
    let reset_in = limiter
        .get_ttl(key)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| limiter.window());
    WindowStatus {
        limit: limiter.rate(),
        remaining,
        reset: get_current_timestamp() + reset_in.as_secs(),
    }
}

fn apply_headers(headers: &mut HeaderMap, window: &WindowStatus) {
    let entries = [
        ("x-ratelimit-limit", window.limit),
        ("x-ratelimit-remaining", window.remaining),
        ("x-ratelimit-reset", window.reset),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn derive_key(strategy: &KeyStrategy, req: &ServiceRequest) -> String {
    match strategy {
        KeyStrategy::ClientIp => client_ip(req),
        KeyStrategy::Header(name) => req
            .headers()
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| client_ip(req)),
        KeyStrategy::Path => req.path().to_string(),
        KeyStrategy::Custom(derive) => derive(req),
    }
}

fn client_ip(req: &ServiceRequest) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
    {
        // The first entry is the original client
        if let Some(client) = forwarded.split(',').next() {
            let client = client.trim();
            if !client.is_empty() {
                return client.to_string();
            }
        }
    }
    if let Some(real_ip) = req
        .headers()
        .get("X-Real-IP")
        .and_then(|value| value.to_str().ok())
    {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    req.connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::testing::InMemoryStore;
    use crate::models::LimiterConfig;
    use actix_web::{test, web, App};

    fn limiter(rate: u64, burst: u64) -> Arc<RateLimiter> {
        let config = LimiterConfig {
            rate,
            burst,
            window_seconds: 60,
            key_prefix: "mw:".to_string(),
            circuit: None,
        };
        Arc::new(RateLimiter::new(Arc::new(InMemoryStore::new()), config).unwrap())
    }

    async fn ok_handler() -> HttpResponse {
        HttpResponse::Ok().body("ok")
    }

    #[actix_web::test]
    async fn allows_within_limit_and_sets_headers() {
        let app = test::init_service(
            App::new()
                .wrap(RateLimit::new(limiter(2, 0)))
                .route("/", web::get().to(ok_handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Forwarded-For", "203.0.113.7"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("x-ratelimit-limit").unwrap(),
            &HeaderValue::from_static("2")
        );
        assert_eq!(
            resp.headers().get("x-ratelimit-remaining").unwrap(),
            &HeaderValue::from_static("1")
        );
        assert!(resp.headers().contains_key("x-ratelimit-reset"));
    }

    #[actix_web::test]
    async fn denies_over_limit_with_json_body() {
        let app = test::init_service(
            App::new()
                .wrap(RateLimit::new(limiter(1, 0)))
                .route("/", web::get().to(ok_handler)),
        )
        .await;

        let allowed = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Forwarded-For", "203.0.113.8"))
            .to_request();
        assert!(test::call_service(&app, allowed).await.status().is_success());

        let denied = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Forwarded-For", "203.0.113.8"))
            .to_request();
        let resp = test::call_service(&app, denied).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get("x-ratelimit-remaining").unwrap(),
            &HeaderValue::from_static("0")
        );

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["message"], "Too many requests");
    }

    #[actix_web::test]
    async fn clients_are_limited_independently() {
        let app = test::init_service(
            App::new()
                .wrap(RateLimit::new(limiter(1, 0)))
                .route("/", web::get().to(ok_handler)),
        )
        .await;

        for ip in ["198.51.100.1", "198.51.100.2", "198.51.100.3"] {
            let req = test::TestRequest::get()
                .uri("/")
                .insert_header(("X-Forwarded-For", ip))
                .to_request();
            assert!(test::call_service(&app, req).await.status().is_success());
        }
    }

    #[actix_web::test]
    async fn custom_denial_handler_is_used() {
        let gate = RateLimit::new(limiter(1, 0)).with_denial_handler(|| {
            HttpResponse::ServiceUnavailable().body("shed")
        });
        let app = test::init_service(
            App::new().wrap(gate).route("/", web::get().to(ok_handler)),
        )
        .await;

        let first = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Forwarded-For", "192.0.2.1"))
            .to_request();
        test::call_service(&app, first).await;

        let second = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Forwarded-For", "192.0.2.1"))
            .to_request();
        let resp = test::call_service(&app, second).await;
        assert_eq!(
            resp.status(),
            actix_web::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[actix_web::test]
    async fn headers_can_be_disabled() {
        let gate = RateLimit::new(limiter(5, 0)).with_headers(false);
        let app = test::init_service(
            App::new().wrap(gate).route("/", web::get().to(ok_handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-Forwarded-For", "192.0.2.2"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert!(!resp.headers().contains_key("x-ratelimit-limit"));
    }

    #[actix_web::test]
    async fn path_strategy_scopes_limits_per_route() {
        let gate = RateLimit::new(limiter(1, 0)).with_strategy(KeyStrategy::Path);
        let app = test::init_service(
            App::new()
                .wrap(gate)
                .route("/a", web::get().to(ok_handler))
                .route("/b", web::get().to(ok_handler)),
        )
        .await;

        let a1 = test::TestRequest::get().uri("/a").to_request();
        assert!(test::call_service(&app, a1).await.status().is_success());
        // Same path, same key
        let a2 = test::TestRequest::get().uri("/a").to_request();
        assert_eq!(
            test::call_service(&app, a2).await.status(),
            actix_web::http::StatusCode::TOO_MANY_REQUESTS
        );
        // A different path has its own window
        let b1 = test::TestRequest::get().uri("/b").to_request();
        assert!(test::call_service(&app, b1).await.status().is_success());
    }

    #[actix_web::test]
    async fn header_strategy_keys_on_user_id() {
        let gate =
            RateLimit::new(limiter(1, 0)).with_strategy(KeyStrategy::Header("X-User-ID".to_string()));
        let app = test::init_service(
            App::new().wrap(gate).route("/", web::get().to(ok_handler)),
        )
        .await;

        let u1 = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-User-ID", "player-1"))
            .to_request();
        assert!(test::call_service(&app, u1).await.status().is_success());

        let u1_again = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-User-ID", "player-1"))
            .to_request();
        assert_eq!(
            test::call_service(&app, u1_again).await.status(),
            actix_web::http::StatusCode::TOO_MANY_REQUESTS
        );

        let u2 = test::TestRequest::get()
            .uri("/")
            .insert_header(("X-User-ID", "player-2"))
            .to_request();
        assert!(test::call_service(&app, u2).await.status().is_success());
    }

    #[actix_web::test]
    async fn client_ip_precedence() {
        let both = test::TestRequest::default()
            .insert_header(("X-Forwarded-For", "198.51.100.9, 10.0.0.1"))
            .insert_header(("X-Real-IP", "203.0.113.9"))
            .to_srv_request();
        assert_eq!(client_ip(&both), "198.51.100.9");

        let real_only = test::TestRequest::default()
            .insert_header(("X-Real-IP", "203.0.113.9"))
            .to_srv_request();
        assert_eq!(client_ip(&real_only), "203.0.113.9");

        let neither = test::TestRequest::default().to_srv_request();
        assert_eq!(client_ip(&neither), "unknown");
    }
}
