//! Admin HTTP surface
//!
//! Thin JSON handlers over the cache engine, rate limit resolver and worker
//! pool. Every route delegates to the component API; no state lives here.

use crate::balancer::{
    PoolStats, ScaleOutcome, WorkerPool, WorkerSnapshot, WorkerSpec, WorkerStatusUpdate,
    POOL_STATS_KEY,
};
use crate::cache::{CacheEngine, CacheMetricsSnapshot, CacheStrategy};
use crate::error::{ControlPlaneError, Result};
use crate::metrics::MetricsService;
use crate::rate_limit::{
    rate_limit_middleware, EndpointType, Environment, RateLimitRecord, RateLimitUpsert,
    RateLimiterService, ResolvedRateLimit,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Shared handles behind the admin routes
#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<CacheEngine>,
    pub rate_limiter: Arc<RateLimiterService>,
    pub pool: Arc<WorkerPool>,
    pub metrics: Option<MetricsService>,
}

/// Build the admin router
///
/// `/health` and `/metrics` are never rate limited; everything under
/// `/admin` is enforced as the `admin` endpoint class.
pub fn router(state: AdminState) -> Router {
    let admin = Router::new()
        .route("/admin/cache/metrics", get(cache_metrics))
        .route("/admin/cache/metrics/reset", post(reset_cache_metrics))
        .route("/admin/cache/clear", post(clear_cache_pattern))
        .route("/admin/rate-limits/configs", get(list_rate_limits).put(upsert_rate_limit))
        .route(
            "/admin/rate-limits/configs/:environment/:endpoint_type",
            patch(toggle_rate_limit).delete(delete_rate_limit),
        )
        .route("/admin/rate-limits/resolve/:endpoint_type", get(resolve_rate_limit))
        .route("/admin/rate-limits/cache/clear", post(clear_rate_limit_cache))
        .route("/admin/rate-limits/cache/refresh", post(refresh_rate_limit_cache))
        .route("/admin/workers", get(list_workers).post(register_worker))
        .route(
            "/admin/workers/:id",
            get(get_worker).patch(update_worker).delete(unregister_worker),
        )
        .route("/admin/pool/stats", get(pool_stats))
        .route("/admin/pool/stats/cached", get(cached_pool_stats))
        .route("/admin/pool/scale", post(scale_pool))
        .route("/admin/pool/select", get(select_worker))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(admin)
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> Response {
    let store_ok = state.cache.ping().await.is_ok();
    let stats = state.pool.stats().await;
    let status = if store_ok { "ok" } else { "degraded" };

    let body = json!({
        "status": status,
        "environment": state.rate_limiter.resolver().environment(),
        "store": { "connected": store_ok },
        "rate_limiter": { "degraded": state.rate_limiter.limiter().is_degraded() },
        "workers": {
            "total": stats.total_nodes,
            "active": stats.active_nodes,
            "health_ratio": stats.health_ratio,
        },
    });

    // The control plane keeps serving without the store, so degraded is still 200
    (StatusCode::OK, Json(body)).into_response()
}

async fn metrics(State(state): State<AdminState>) -> Response {
    match &state.metrics {
        Some(service) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            service.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

// ----- cache -----

async fn cache_metrics(State(state): State<AdminState>) -> Json<CacheMetricsSnapshot> {
    Json(state.cache.metrics())
}

async fn reset_cache_metrics(State(state): State<AdminState>) -> StatusCode {
    state.cache.reset_metrics();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct ClearPatternRequest {
    strategy: String,
    #[serde(default = "default_pattern")]
    pattern: String,
}

fn default_pattern() -> String {
    "*".to_string()
}

async fn clear_cache_pattern(
    State(state): State<AdminState>,
    Json(request): Json<ClearPatternRequest>,
) -> Result<Json<Value>> {
    let strategy: CacheStrategy = request.strategy.parse()?;
    let deleted = state.cache.clear_pattern(strategy, &request.pattern).await;
    info!(%strategy, pattern = %request.pattern, deleted, "Cleared cache pattern");
    Ok(Json(json!({ "strategy": strategy, "pattern": request.pattern, "deleted": deleted })))
}

// ----- rate limits -----

#[derive(Debug, Deserialize)]
struct EnvironmentQuery {
    environment: Option<String>,
}

impl EnvironmentQuery {
    fn parse(&self) -> Result<Option<Environment>> {
        self.environment.as_deref().map(str::parse).transpose()
    }
}

fn parse_pair(environment: &str, endpoint_type: &str) -> Result<(Environment, EndpointType)> {
    Ok((environment.parse()?, endpoint_type.parse()?))
}

async fn list_rate_limits(
    State(state): State<AdminState>,
    Query(query): Query<EnvironmentQuery>,
) -> Result<Json<Vec<RateLimitRecord>>> {
    let records = state.rate_limiter.resolver().list_configs(query.parse()?).await?;
    Ok(Json(records))
}

async fn upsert_rate_limit(
    State(state): State<AdminState>,
    Json(upsert): Json<RateLimitUpsert>,
) -> Result<Json<RateLimitRecord>> {
    let record = state.rate_limiter.resolver().upsert_config(upsert).await?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    active: bool,
    #[serde(default)]
    actor: Option<String>,
}

async fn toggle_rate_limit(
    State(state): State<AdminState>,
    Path((environment, endpoint_type)): Path<(String, String)>,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<RateLimitRecord>> {
    let (environment, endpoint_type) = parse_pair(&environment, &endpoint_type)?;
    state
        .rate_limiter
        .resolver()
        .set_config_active(environment, endpoint_type, request.active, request.actor)
        .await?
        .map(Json)
        .ok_or_else(|| ControlPlaneError::ConfigNotFound {
            environment: environment.to_string(),
            endpoint_type: endpoint_type.to_string(),
        })
}

async fn delete_rate_limit(
    State(state): State<AdminState>,
    Path((environment, endpoint_type)): Path<(String, String)>,
) -> Result<StatusCode> {
    let (environment, endpoint_type) = parse_pair(&environment, &endpoint_type)?;
    if state
        .rate_limiter
        .resolver()
        .delete_config(environment, endpoint_type)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ControlPlaneError::ConfigNotFound {
            environment: environment.to_string(),
            endpoint_type: endpoint_type.to_string(),
        })
    }
}

async fn resolve_rate_limit(
    State(state): State<AdminState>,
    Path(endpoint_type): Path<String>,
    Query(query): Query<EnvironmentQuery>,
) -> Result<Json<ResolvedRateLimit>> {
    let endpoint_type: EndpointType = endpoint_type.parse()?;
    let resolver = state.rate_limiter.resolver();
    let environment = query.parse()?.unwrap_or_else(|| resolver.environment());
    Ok(Json(resolver.resolve_for(environment, endpoint_type).await))
}

#[derive(Debug, Default, Deserialize)]
struct ClearRateLimitRequest {
    #[serde(default)]
    endpoint_type: Option<String>,
}

async fn clear_rate_limit_cache(
    State(state): State<AdminState>,
    request: Option<Json<ClearRateLimitRequest>>,
) -> Result<Json<Value>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let endpoint_type = request
        .endpoint_type
        .as_deref()
        .map(str::parse::<EndpointType>)
        .transpose()?;

    let cleared = state.rate_limiter.resolver().clear_cache(endpoint_type).await;
    Ok(Json(json!({ "cleared": cleared })))
}

#[derive(Debug, Serialize)]
struct WarmedLimit {
    endpoint_type: EndpointType,
    #[serde(flatten)]
    limit: ResolvedRateLimit,
}

async fn refresh_rate_limit_cache(State(state): State<AdminState>) -> Json<Vec<WarmedLimit>> {
    let warmed = state
        .rate_limiter
        .resolver()
        .refresh_cache()
        .await
        .into_iter()
        .map(|(endpoint_type, limit)| WarmedLimit { endpoint_type, limit })
        .collect();
    Json(warmed)
}

// ----- workers -----

async fn list_workers(State(state): State<AdminState>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.pool.snapshots().await)
}

async fn register_worker(
    State(state): State<AdminState>,
    Json(spec): Json<WorkerSpec>,
) -> Result<(StatusCode, Json<WorkerSnapshot>)> {
    let node = state.pool.register(spec).await?;
    Ok((StatusCode::CREATED, Json(node.snapshot())))
}

async fn get_worker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<WorkerSnapshot>> {
    state
        .pool
        .get(&id)
        .await
        .map(|node| Json(node.snapshot()))
        .ok_or(ControlPlaneError::WorkerNotFound(id))
}

async fn update_worker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(update): Json<WorkerStatusUpdate>,
) -> Result<Json<WorkerSnapshot>> {
    Ok(Json(state.pool.update_status(&id, update).await?))
}

async fn unregister_worker(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if state.pool.unregister(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ControlPlaneError::WorkerNotFound(id))
    }
}

async fn pool_stats(State(state): State<AdminState>) -> Json<PoolStats> {
    Json(state.pool.stats().await)
}

async fn cached_pool_stats(State(state): State<AdminState>) -> Response {
    match state
        .cache
        .get::<PoolStats>(CacheStrategy::Workers, POOL_STATS_KEY)
        .await
    {
        Some(stats) => Json(stats).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no published pool stats", "code": "STATS_NOT_PUBLISHED", "status": 404 })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    target: usize,
}

async fn scale_pool(
    State(state): State<AdminState>,
    Json(request): Json<ScaleRequest>,
) -> Json<ScaleOutcome> {
    Json(state.pool.scale(request.target).await)
}

#[derive(Debug, Deserialize)]
struct SelectQuery {
    capability: Option<String>,
    routing_key: Option<String>,
}

async fn select_worker(
    State(state): State<AdminState>,
    Query(query): Query<SelectQuery>,
) -> Result<Json<WorkerSnapshot>> {
    state
        .pool
        .select_node(query.capability.as_deref(), query.routing_key.as_deref())
        .await
        .map(|node| Json(node.snapshot()))
        .ok_or_else(|| {
            ControlPlaneError::NoHealthyWorker(query.capability.unwrap_or_else(|| "any".to_string()))
        })
}
