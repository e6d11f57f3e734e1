//! Runtime control plane for a trading-automation backend
//!
//! Three cooperating components sit between the HTTP surface and the
//! backing stores:
//!
//! - [`cache::CacheEngine`]: strategy-based cache over the shared key-value store
//! - [`rate_limit::RateLimitResolver`]: environment-aware rate limits with
//!   layered resolution and fixed-window enforcement
//! - [`balancer::WorkerPool`]: worker registry, selection, execution with
//!   retries, health checks and scaling
//!
//! [`ControlPlane`] wires them together with explicit `start` / `shutdown`.

pub mod admin;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod metrics;
pub mod observability;
pub mod rate_limit;
pub mod store;

use crate::admin::AdminState;
use crate::balancer::WorkerPool;
use crate::cache::CacheEngine;
use crate::config::ControlPlaneConfig;
use crate::error::{ControlPlaneError, Result};
use crate::healthcheck::HealthChecker;
use crate::metrics::MetricsService;
use crate::rate_limit::{
    detect_environment, EnvSnapshot, FixedWindowLimiter, InMemoryRateLimitRepository,
    RateLimitRepository, RateLimitResolver, RateLimiterService,
};
use crate::store::{KeyValueStore, MemoryStore, RedisStore};
use axum::{middleware, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// The assembled control plane
pub struct ControlPlane {
    config: ControlPlaneConfig,
    cache: Arc<CacheEngine>,
    rate_limiter: Arc<RateLimiterService>,
    pool: Arc<WorkerPool>,
    health_checker: Arc<HealthChecker>,
    metrics: Option<MetricsService>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("environment", &self.rate_limiter.resolver().environment())
            .field("pool", &self.pool)
            .finish()
    }
}

impl ControlPlane {
    /// Build from configuration: Redis when a URL is configured, otherwise
    /// the in-memory store; the rate limit repository is seeded from config.
    ///
    /// An unreachable Redis does not prevent startup; the control plane runs
    /// degraded until the store connects.
    pub async fn build(config: ControlPlaneConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn KeyValueStore> = match &config.redis.url {
            Some(url) => Arc::new(RedisStore::connect_or_degrade(url).await?),
            None => {
                info!("No Redis URL configured, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let repository = InMemoryRateLimitRepository::with_records(config.rate_limit.seed.clone()).await?;

        Self::with_components(config, store, Arc::new(repository))
    }

    /// Build around an existing store and repository
    pub fn with_components(
        config: ControlPlaneConfig,
        store: Arc<dyn KeyValueStore>,
        repository: Arc<dyn RateLimitRepository>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheEngine::new(store.clone(), config.cache.clone()));

        let environment = config.rate_limit.environment.unwrap_or_else(|| {
            detect_environment(&EnvSnapshot::from_process(Some(config.server.port)))
        });
        let resolver = Arc::new(RateLimitResolver::new(
            environment,
            cache.clone(),
            repository,
            &config.rate_limit,
        ));
        let limiter = FixedWindowLimiter::new(store, config.cache.namespace.clone());
        let rate_limiter = Arc::new(RateLimiterService::new(
            resolver,
            limiter,
            config.rate_limit.enabled,
        ));

        let pool = Arc::new(WorkerPool::new(config.balancer.clone())?);
        let health_checker = Arc::new(
            HealthChecker::new(config.health_check.clone())?.with_stats_cache(cache.clone()),
        );

        Ok(Self {
            config,
            cache,
            rate_limiter,
            pool,
            health_checker,
            metrics: None,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Serve Prometheus metrics on `/metrics`
    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiterService> {
        &self.rate_limiter
    }

    pub fn resolver(&self) -> &Arc<RateLimitResolver> {
        self.rate_limiter.resolver()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }

    /// Warm the rate limit cache and start background loops
    pub async fn start(&self) {
        if self.cache.ping().await.is_err() {
            warn!("Key-value store unreachable at startup, continuing degraded");
        }

        let warmed = self.resolver().refresh_cache().await;
        info!(
            environment = %self.resolver().environment(),
            endpoint_types = warmed.len(),
            "Rate limits resolved"
        );

        if let Some(handle) = self.health_checker.clone().start(self.pool.clone()) {
            self.track(handle);
        }

        info!(workers = self.pool.len().await, "Control plane started");
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Number of background tasks still running
    pub fn running_tasks(&self) -> usize {
        let tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop background loops
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        for handle in &handles {
            handle.abort();
        }
        info!(stopped = handles.len(), "Control plane shut down");
    }

    /// Admin router with tracing, CORS and request ids applied
    pub fn router(&self) -> Router {
        admin::router(AdminState {
            cache: self.cache.clone(),
            rate_limiter: self.rate_limiter.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
        })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(observability::request_id_middleware)),
        )
    }

    /// Serve the admin surface until `shutdown` resolves
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("Control plane listening on {}", addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ControlPlaneError::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}
