use super::limiter::FixedWindowLimiter;
use super::resolver::RateLimitResolver;
use super::types::{EndpointType, RateLimitKey, RateLimitResult, ResolvedRateLimit};
use crate::error::{ControlPlaneError, Result};
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a rate limit check together with the limit that was applied
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub endpoint_type: EndpointType,
    pub limit: ResolvedRateLimit,
    pub result: RateLimitResult,
}

impl RateLimitDecision {
    /// The rejection as a caller-facing error
    pub fn into_error(self) -> ControlPlaneError {
        ControlPlaneError::LimitExceeded {
            message: self.limit.message,
            limit: self.result.limit,
            retry_after_secs: self.result.retry_after.unwrap_or(self.result.reset_after),
        }
    }
}

/// Rate limiter service: resolves the limit, then counts against it
pub struct RateLimiterService {
    resolver: Arc<RateLimitResolver>,
    limiter: FixedWindowLimiter,
    enabled: bool,
}

impl std::fmt::Debug for RateLimiterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterService")
            .field("resolver", &self.resolver)
            .field("limiter", &self.limiter)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Whole seconds until `d` elapses, at least one
fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1_000).max(1) as u64
}

impl RateLimiterService {
    pub fn new(resolver: Arc<RateLimitResolver>, limiter: FixedWindowLimiter, enabled: bool) -> Self {
        info!(
            environment = %resolver.environment(),
            enabled,
            "Initialized rate limiter service"
        );
        Self {
            resolver,
            limiter,
            enabled,
        }
    }

    pub fn resolver(&self) -> &Arc<RateLimitResolver> {
        &self.resolver
    }

    pub fn limiter(&self) -> &FixedWindowLimiter {
        &self.limiter
    }

    /// Check a request from `identity` against its endpoint class
    ///
    /// Counts the attempt unless the limit skips successful requests; those
    /// are only counted through [`record_outcome`](Self::record_outcome).
    pub async fn check(&self, identity: &str, endpoint_type: EndpointType) -> RateLimitDecision {
        let limit = self.resolver.resolve(endpoint_type).await;
        let max = u64::from(limit.max);

        if !self.enabled {
            return RateLimitDecision {
                endpoint_type,
                result: RateLimitResult::allowed(max, limit.max, limit.window().as_secs()),
                limit,
            };
        }

        let key = RateLimitKey::new(identity, endpoint_type);
        let (allowed, window) = if limit.skip_successful_requests {
            let window = self.limiter.peek(&key, limit.window()).await;
            (window.count < max, window)
        } else {
            let window = self.limiter.hit(&key, limit.window()).await;
            (window.count <= max, window)
        };

        let reset_after = ceil_secs(window.reset_after);
        let result = if allowed {
            let used = if limit.skip_successful_requests {
                window.count + 1
            } else {
                window.count
            };
            RateLimitResult::allowed(max.saturating_sub(used), limit.max, reset_after)
        } else {
            warn!(
                identity = %identity,
                %endpoint_type,
                count = window.count,
                max = limit.max,
                "Rate limit exceeded"
            );
            RateLimitResult::denied(limit.max, reset_after)
        };

        metrics::record_rate_limit_check(
            self.resolver.environment().as_str(),
            endpoint_type.as_str(),
            allowed,
        );
        debug!(
            identity = %identity,
            %endpoint_type,
            allowed,
            remaining = result.remaining,
            "Rate limit check"
        );

        RateLimitDecision {
            endpoint_type,
            limit,
            result,
        }
    }

    /// Like [`check`](Self::check), but a rejection is returned as
    /// [`ControlPlaneError::LimitExceeded`]
    pub async fn enforce(&self, identity: &str, endpoint_type: EndpointType) -> Result<RateLimitDecision> {
        let decision = self.check(identity, endpoint_type).await;
        if decision.result.allowed {
            Ok(decision)
        } else {
            Err(decision.into_error())
        }
    }

    /// Report how an admitted request ended
    ///
    /// For limits that skip successful requests a failed attempt is counted
    /// here; a success leaves the window untouched (it is not reset).
    pub async fn record_outcome(&self, identity: &str, endpoint_type: EndpointType, success: bool) {
        if !self.enabled || success {
            return;
        }

        let limit = self.resolver.resolve(endpoint_type).await;
        if limit.skip_successful_requests {
            let key = RateLimitKey::new(identity, endpoint_type);
            let window = self.limiter.hit(&key, limit.window()).await;
            debug!(identity = %identity, %endpoint_type, count = window.count, "Counted failed attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheEngine};
    use crate::rate_limit::repository::{InMemoryRateLimitRepository, RateLimitRepository};
    use crate::rate_limit::types::{Environment, RateLimitSettings, RateLimitUpsert};
    use crate::store::MemoryStore;

    async fn service(max: u32, window_ms: u64, skip_successful: bool) -> RateLimiterService {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheEngine::new(store.clone(), CacheConfig::default()));
        let repository = Arc::new(InMemoryRateLimitRepository::new());
        repository
            .upsert(RateLimitUpsert {
                environment: Environment::Staging,
                endpoint_type: EndpointType::Auth,
                max_requests: max,
                window_ms,
                message: Some("Too many login attempts".to_string()),
                skip_successful_requests: skip_successful,
                is_active: true,
                actor: None,
            })
            .await
            .unwrap();

        let resolver = Arc::new(RateLimitResolver::new(
            Environment::Staging,
            cache,
            repository,
            &RateLimitSettings::default(),
        ));
        RateLimiterService::new(resolver, FixedWindowLimiter::new(store, "trading:"), true)
    }

    #[tokio::test]
    async fn test_fixed_window_enforcement() {
        let service = service(5, 300, false).await;

        for i in 0..5 {
            let decision = service.enforce("10.0.0.1", EndpointType::Auth).await;
            assert!(decision.is_ok(), "request {} should be allowed", i + 1);
        }

        match service.enforce("10.0.0.1", EndpointType::Auth).await {
            Err(ControlPlaneError::LimitExceeded {
                message,
                limit,
                retry_after_secs,
            }) => {
                assert_eq!(message, "Too many login attempts");
                assert_eq!(limit, 5);
                assert_eq!(retry_after_secs, 1);
            }
            other => panic!("expected LimitExceeded, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(service.enforce("10.0.0.1", EndpointType::Auth).await.is_ok());
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let service = service(3, 60_000, false).await;

        let remaining: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(service.check("10.0.0.2", EndpointType::Auth).await.result.remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let service = service(1, 60_000, false).await;

        assert!(service.enforce("10.0.0.3", EndpointType::Auth).await.is_ok());
        assert!(service.enforce("10.0.0.3", EndpointType::Auth).await.is_err());
        assert!(service.enforce("10.0.0.4", EndpointType::Auth).await.is_ok());
    }

    #[tokio::test]
    async fn test_skip_successful_counts_only_failures() {
        let service = service(2, 60_000, true).await;

        // Successful logins never consume the budget
        for _ in 0..10 {
            assert!(service.enforce("10.0.0.5", EndpointType::Auth).await.is_ok());
            service.record_outcome("10.0.0.5", EndpointType::Auth, true).await;
        }

        service.record_outcome("10.0.0.5", EndpointType::Auth, false).await;
        assert!(service.enforce("10.0.0.5", EndpointType::Auth).await.is_ok());
        service.record_outcome("10.0.0.5", EndpointType::Auth, false).await;

        assert!(service.enforce("10.0.0.5", EndpointType::Auth).await.is_err());
    }

    #[tokio::test]
    async fn test_success_does_not_reset_failures() {
        let service = service(2, 60_000, true).await;

        service.record_outcome("10.0.0.6", EndpointType::Auth, false).await;
        service.record_outcome("10.0.0.6", EndpointType::Auth, true).await;
        service.record_outcome("10.0.0.6", EndpointType::Auth, false).await;

        assert!(service.enforce("10.0.0.6", EndpointType::Auth).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_service_allows_everything() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheEngine::new(store.clone(), CacheConfig::default()));
        let resolver = Arc::new(RateLimitResolver::new(
            Environment::Production,
            cache,
            Arc::new(InMemoryRateLimitRepository::new()),
            &RateLimitSettings::default(),
        ));
        let service = RateLimiterService::new(resolver, FixedWindowLimiter::new(store, "trading:"), false);

        for _ in 0..20 {
            assert!(service.enforce("10.0.0.7", EndpointType::Auth).await.is_ok());
        }
    }
}
