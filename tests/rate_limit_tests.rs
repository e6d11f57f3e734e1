use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::{get, post},
    Router,
};
use control_plane::cache::{CacheConfig, CacheEngine};
use control_plane::error::ControlPlaneError;
use control_plane::rate_limit::{
    detect_environment, rate_limit_middleware, static_limit, EndpointType, EnvSnapshot,
    Environment, FixedWindowLimiter, InMemoryRateLimitRepository, RateLimitResolver,
    RateLimitSettings, RateLimitUpsert, RateLimiterService, ResolutionSource,
};
use control_plane::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn upsert(environment: Environment, endpoint_type: EndpointType, max: u32, window_ms: u64) -> RateLimitUpsert {
    RateLimitUpsert {
        environment,
        endpoint_type,
        max_requests: max,
        window_ms,
        message: None,
        skip_successful_requests: false,
        is_active: true,
        actor: Some("ops".to_string()),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    service: Arc<RateLimiterService>,
}

async fn harness(environment: Environment, records: Vec<RateLimitUpsert>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(CacheEngine::new(store.clone(), CacheConfig::default()));
    let repository = Arc::new(InMemoryRateLimitRepository::with_records(records).await.unwrap());
    let resolver = Arc::new(RateLimitResolver::new(
        environment,
        cache,
        repository,
        &RateLimitSettings::default(),
    ));
    let limiter = FixedWindowLimiter::new(store.clone(), "trading:");

    Harness {
        store,
        service: Arc::new(RateLimiterService::new(resolver, limiter, true)),
    }
}

#[tokio::test]
async fn test_resolution_order_exact_global_static() {
    let h = harness(
        Environment::Production,
        vec![
            upsert(Environment::Production, EndpointType::Trading, 42, 60_000),
            upsert(Environment::Global, EndpointType::Trading, 7, 60_000),
            upsert(Environment::Global, EndpointType::Payments, 9, 60_000),
        ],
    )
    .await;
    let resolver = h.service.resolver();

    let trading = resolver.resolve(EndpointType::Trading).await;
    assert_eq!((trading.max, trading.source), (42, ResolutionSource::Exact));

    let payments = resolver.resolve(EndpointType::Payments).await;
    assert_eq!((payments.max, payments.source), (9, ResolutionSource::Global));

    let auth = resolver.resolve(EndpointType::Auth).await;
    assert_eq!(auth, static_limit(Environment::Production, EndpointType::Auth));
    assert_eq!(auth.source, ResolutionSource::Static);
}

#[tokio::test]
async fn test_deactivated_record_falls_through() {
    let h = harness(
        Environment::Staging,
        vec![upsert(Environment::Staging, EndpointType::Api, 3, 60_000)],
    )
    .await;
    let resolver = h.service.resolver();

    assert_eq!(resolver.resolve(EndpointType::Api).await.max, 3);

    resolver
        .set_config_active(Environment::Staging, EndpointType::Api, false, None)
        .await
        .unwrap();

    let resolved = resolver.resolve(EndpointType::Api).await;
    assert_eq!(resolved.source, ResolutionSource::Static);
    assert_eq!(resolved.max, static_limit(Environment::Staging, EndpointType::Api).max);
}

#[tokio::test]
async fn test_fifth_allowed_sixth_rejected_then_reset() {
    let h = harness(
        Environment::Production,
        vec![upsert(Environment::Production, EndpointType::Auth, 5, 400)],
    )
    .await;

    for _ in 0..5 {
        assert!(h.service.enforce("198.51.100.1", EndpointType::Auth).await.is_ok());
    }

    let rejected = h.service.enforce("198.51.100.1", EndpointType::Auth).await;
    assert!(matches!(rejected, Err(ControlPlaneError::LimitExceeded { limit: 5, .. })));

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(h.service.enforce("198.51.100.1", EndpointType::Auth).await.is_ok());
}

#[tokio::test]
async fn test_enforcement_continues_when_store_is_down() {
    let h = harness(
        Environment::Production,
        vec![upsert(Environment::Production, EndpointType::Trading, 2, 60_000)],
    )
    .await;

    // Resolve while the store is still up so the persisted limit is known
    assert_eq!(h.service.resolver().resolve(EndpointType::Trading).await.max, 2);
    h.store.set_available(false);

    assert!(h.service.enforce("198.51.100.2", EndpointType::Trading).await.is_ok());
    assert!(h.service.enforce("198.51.100.2", EndpointType::Trading).await.is_ok());
    assert!(h.service.enforce("198.51.100.2", EndpointType::Trading).await.is_err());
    assert!(h.service.limiter().is_degraded());
}

#[test]
fn test_environment_cascade() {
    let explicit = EnvSnapshot {
        environment: Some("production".to_string()),
        app_env: Some("development".to_string()),
        port: Some(3000),
        cors_origin: None,
    };
    assert_eq!(detect_environment(&explicit), Environment::Production);

    let by_port = EnvSnapshot {
        port: Some(443),
        ..Default::default()
    };
    assert_eq!(detect_environment(&by_port), Environment::Production);

    let by_origin = EnvSnapshot {
        cors_origin: Some("https://staging.example.com".to_string()),
        ..Default::default()
    };
    assert_eq!(detect_environment(&by_origin), Environment::Staging);

    assert_eq!(detect_environment(&EnvSnapshot::default()), Environment::Development);
}

fn app(service: Arc<RateLimiterService>) -> Router {
    Router::new()
        .route("/api/auth/login", post(|| async { StatusCode::UNAUTHORIZED }))
        .route("/api/trading/orders", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(service, rate_limit_middleware))
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_middleware_sets_headers_and_rejects() {
    let h = harness(
        Environment::Production,
        vec![upsert(Environment::Production, EndpointType::Trading, 2, 60_000)],
    )
    .await;
    let app = app(h.service.clone());

    let first = app.clone().oneshot(request("GET", "/api/trading/orders")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(first.headers().get("x-ratelimit-remaining").unwrap(), "1");

    let second = app.clone().oneshot(request("GET", "/api/trading/orders")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let third = app.oneshot(request("GET", "/api/trading/orders")).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(third.headers().get("retry-after").is_some());
}

#[tokio::test]
async fn test_middleware_counts_failed_logins_only() {
    let mut auth = upsert(Environment::Production, EndpointType::Auth, 2, 60_000);
    auth.skip_successful_requests = true;
    let h = harness(Environment::Production, vec![auth]).await;
    let app = app(h.service.clone());

    // Every login fails with 401, so each one is counted
    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/api/auth/login")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let blocked = app.oneshot(request("POST", "/api/auth/login")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
}
