//! Layered rate limit resolution
//!
//! Lookup order for an `(environment, endpoint_type)` pair:
//!
//! 1. in-process map (moka, short TTL)
//! 2. shared cache through the [`CacheEngine`] `rate_limit` strategy
//! 3. repository, exact environment first and then `global`
//! 4. compiled-in static table
//!
//! Any failure along the way resolves to the development table instead of
//! failing the request; enforcement is the real safety net.

use super::defaults::{fallback_limit, static_limit};
use super::repository::RateLimitRepository;
use super::types::{
    EndpointType, Environment, RateLimitRecord, RateLimitSettings, RateLimitUpsert,
    ResolutionSource, ResolvedRateLimit,
};
use crate::cache::{CacheEngine, CacheStrategy};
use crate::error::Result;
use crate::metrics;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ENVIRONMENTS: [Environment; 4] = [
    Environment::Development,
    Environment::Staging,
    Environment::Production,
    Environment::Global,
];

pub struct RateLimitResolver {
    environment: Environment,
    cache: Arc<CacheEngine>,
    repository: Arc<dyn RateLimitRepository>,
    local: Cache<(Environment, EndpointType), ResolvedRateLimit>,
    /// Bumped by every invalidation; a resolution that started under an
    /// older generation is not cached
    generation: AtomicU64,
}

impl std::fmt::Debug for RateLimitResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitResolver")
            .field("environment", &self.environment)
            .field("local_entries", &self.local.entry_count())
            .finish()
    }
}

impl RateLimitResolver {
    pub fn new(
        environment: Environment,
        cache: Arc<CacheEngine>,
        repository: Arc<dyn RateLimitRepository>,
        settings: &RateLimitSettings,
    ) -> Self {
        let local = Cache::builder()
            .max_capacity(settings.local_capacity)
            .time_to_live(Duration::from_secs(settings.resolved_ttl_secs))
            .build();

        info!(%environment, "Initialized rate limit resolver");

        Self {
            environment,
            cache,
            repository,
            local,
            generation: AtomicU64::new(0),
        }
    }

    /// Environment this process enforces limits for
    pub fn environment(&self) -> Environment {
        self.environment
    }

    fn cache_key(environment: Environment, endpoint_type: EndpointType) -> String {
        format!("config:{}:{}", environment, endpoint_type)
    }

    /// Effective limit for an endpoint class in the detected environment
    pub async fn resolve(&self, endpoint_type: EndpointType) -> ResolvedRateLimit {
        self.resolve_for(self.environment, endpoint_type).await
    }

    /// Effective limit for an explicit environment. Never fails.
    pub async fn resolve_for(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
    ) -> ResolvedRateLimit {
        let key = (environment, endpoint_type);
        if let Some(resolved) = self.local.get(&key).await {
            return resolved;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let resolved = match self.load(environment, endpoint_type).await {
            Ok(resolved) => {
                if self.generation.load(Ordering::Acquire) == generation {
                    self.local.insert(key, resolved.clone()).await;
                } else {
                    // Invalidated mid-flight: the shared entry this load wrote may be stale too
                    debug!(%environment, %endpoint_type, "Cache cleared during resolution, not caching");
                    self.cache
                        .delete(CacheStrategy::RateLimit, &Self::cache_key(environment, endpoint_type))
                        .await;
                }
                resolved
            }
            Err(e) => {
                warn!(
                    %environment,
                    %endpoint_type,
                    error = %e,
                    "Rate limit resolution failed, using development defaults"
                );
                fallback_limit(endpoint_type)
            }
        };

        debug!(
            %environment,
            %endpoint_type,
            source = resolved.source.as_str(),
            max = resolved.max,
            window_ms = resolved.window_ms,
            "Resolved rate limit"
        );
        metrics::record_rate_limit_resolution(resolved.source.as_str());
        resolved
    }

    async fn load(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
    ) -> Result<ResolvedRateLimit> {
        let persisted = if self.cache.is_connected() {
            let cache_key = Self::cache_key(environment, endpoint_type);
            self.cache
                .get_or_fetch(CacheStrategy::RateLimit, &cache_key, || {
                    self.find_persisted(environment, endpoint_type)
                })
                .await?
        } else {
            self.find_persisted(environment, endpoint_type).await?
        };

        Ok(persisted.unwrap_or_else(|| static_limit(environment, endpoint_type)))
    }

    async fn find_persisted(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
    ) -> Result<Option<ResolvedRateLimit>> {
        if let Some(record) = self.repository.find_active(environment, endpoint_type).await? {
            return Ok(Some(ResolvedRateLimit::from_record(
                &record,
                ResolutionSource::Exact,
            )));
        }

        if environment != Environment::Global {
            if let Some(record) = self
                .repository
                .find_active(Environment::Global, endpoint_type)
                .await?
            {
                return Ok(Some(ResolvedRateLimit::from_record(
                    &record,
                    ResolutionSource::Global,
                )));
            }
        }

        Ok(None)
    }

    /// Drop cached resolutions for one endpoint class (every environment),
    /// or for everything when `endpoint_type` is None
    pub async fn clear_cache(&self, endpoint_type: Option<EndpointType>) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel);
        match endpoint_type {
            Some(endpoint_type) => {
                for environment in ENVIRONMENTS {
                    self.local.invalidate(&(environment, endpoint_type)).await;
                }
                let keys: Vec<String> = ENVIRONMENTS
                    .iter()
                    .map(|env| Self::cache_key(*env, endpoint_type))
                    .collect();
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                let removed = self.cache.delete_many(CacheStrategy::RateLimit, &keys).await;
                info!(%endpoint_type, removed, "Cleared rate limit cache");
                removed
            }
            None => {
                self.local.invalidate_all();
                let removed = self
                    .cache
                    .clear_pattern(CacheStrategy::RateLimit, "config:*")
                    .await;
                info!(removed, "Cleared all rate limit cache entries");
                removed
            }
        }
    }

    /// Re-resolve every endpoint class for the current environment
    pub async fn refresh_cache(&self) -> Vec<(EndpointType, ResolvedRateLimit)> {
        let environment = self.environment;
        self.generation.fetch_add(1, Ordering::AcqRel);
        for endpoint_type in EndpointType::ALL {
            self.local.invalidate(&(environment, endpoint_type)).await;
        }
        let keys: Vec<String> = EndpointType::ALL
            .iter()
            .map(|endpoint| Self::cache_key(environment, *endpoint))
            .collect();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.cache.delete_many(CacheStrategy::RateLimit, &keys).await;

        let mut warmed = Vec::with_capacity(EndpointType::ALL.len());
        for endpoint_type in EndpointType::ALL {
            warmed.push((endpoint_type, self.resolve(endpoint_type).await));
        }

        info!(%environment, "Refreshed rate limit cache");
        warmed
    }

    pub async fn list_configs(&self, environment: Option<Environment>) -> Result<Vec<RateLimitRecord>> {
        self.repository.list(environment).await
    }

    pub async fn upsert_config(&self, upsert: RateLimitUpsert) -> Result<RateLimitRecord> {
        let record = self.repository.upsert(upsert).await?;
        self.clear_cache(Some(record.endpoint_type)).await;
        Ok(record)
    }

    pub async fn set_config_active(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
        active: bool,
        actor: Option<String>,
    ) -> Result<Option<RateLimitRecord>> {
        let record = self
            .repository
            .set_active(environment, endpoint_type, active, actor)
            .await?;
        if record.is_some() {
            self.clear_cache(Some(endpoint_type)).await;
        }
        Ok(record)
    }

    pub async fn delete_config(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
    ) -> Result<bool> {
        let removed = self.repository.delete(environment, endpoint_type).await?;
        if removed {
            self.clear_cache(Some(endpoint_type)).await;
        }
        Ok(removed)
    }
}
