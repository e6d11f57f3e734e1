//! Strategy-based cache engine over the shared key-value store
//!
//! The engine is an accelerator, never a correctness dependency: store
//! failures are counted and logged but never returned to the caller, and
//! [`CacheEngine::get_or_fetch`] degrades to the source of truth when the
//! store cannot be reached.

pub mod stats;
pub mod strategy;

pub use stats::{CacheMetrics, CacheMetricsSnapshot};
pub use strategy::{CacheStrategy, StrategyPolicy};

use crate::error::{ControlPlaneError, Result};
use crate::metrics;
use crate::store::{KeyTtl, KeyValueStore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix prepended to every key, ahead of the strategy prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Per-strategy TTL overrides in seconds
    #[serde(default)]
    pub ttl_overrides: HashMap<CacheStrategy, u64>,
}

fn default_namespace() -> String {
    "trading:".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            ttl_overrides: HashMap::new(),
        }
    }
}

/// Outcome of a store lookup
enum Lookup<T> {
    Hit(T),
    Miss,
    Unavailable,
}

/// Cache engine applying named strategies to the shared store
pub struct CacheEngine {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    ttl_overrides: HashMap<CacheStrategy, Duration>,
    metrics: CacheMetrics,
    connected: AtomicBool,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("namespace", &self.namespace)
            .field("ttl_overrides", &self.ttl_overrides)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl CacheEngine {
    /// Create a new cache engine
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let ttl_overrides = config
            .ttl_overrides
            .iter()
            .map(|(strategy, secs)| (*strategy, Duration::from_secs(*secs)))
            .collect();

        info!(
            namespace = %config.namespace,
            overrides = config.ttl_overrides.len(),
            "Initialized cache engine"
        );

        Self {
            store,
            namespace: config.namespace,
            ttl_overrides,
            metrics: CacheMetrics::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Effective policy for a strategy, with configured TTL overrides applied
    pub fn policy(&self, strategy: CacheStrategy) -> StrategyPolicy {
        let mut policy = strategy.policy();
        if let Some(ttl) = self.ttl_overrides.get(&strategy) {
            policy.ttl = *ttl;
        }
        policy
    }

    fn full_key(&self, strategy: CacheStrategy, key: &str) -> String {
        format!("{}{}{}", self.namespace, strategy.policy().key_prefix, key)
    }

    /// Note a successful store round trip
    fn mark_ok(&self) {
        if !self.connected.swap(true, Ordering::Relaxed) {
            info!("Key-value store connection restored");
        }
    }

    /// Count and log a store failure
    fn record_error(&self, strategy: CacheStrategy, operation: &str, err: &ControlPlaneError) {
        self.metrics.record_error();
        metrics::record_cache_operation(strategy.name(), "error");

        if matches!(err, ControlPlaneError::StoreUnavailable(_))
            && self.connected.swap(false, Ordering::Relaxed)
        {
            warn!(error = %err, "Key-value store connection lost");
        }

        warn!(
            strategy = %strategy,
            operation = operation,
            error = %err,
            "Cache operation failed"
        );
    }

    fn encode<T: Serialize + ?Sized>(policy: &StrategyPolicy, value: &T) -> Result<String> {
        let json = serde_json::to_value(value)?;
        match json {
            Value::String(raw) if !policy.serialize => Ok(raw),
            other => Ok(other.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(policy: &StrategyPolicy, raw: &str) -> Result<T> {
        if policy.serialize {
            return Ok(serde_json::from_str(raw)?);
        }
        // Raw values may be plain strings that are not valid JSON
        serde_json::from_str(raw)
            .or_else(|_| serde_json::from_value(Value::String(raw.to_string())))
            .map_err(ControlPlaneError::from)
    }

    async fn lookup<T: DeserializeOwned>(&self, strategy: CacheStrategy, key: &str) -> Lookup<T> {
        let policy = self.policy(strategy);
        let full_key = self.full_key(strategy, key);

        let raw = match self.store.get(&full_key).await {
            Ok(raw) => {
                self.mark_ok();
                raw
            }
            Err(e) => {
                self.record_error(strategy, "get", &e);
                return Lookup::Unavailable;
            }
        };

        let Some(raw) = raw else {
            self.metrics.record_miss();
            metrics::record_cache_operation(strategy.name(), "miss");
            debug!(strategy = %strategy, key = %key, "Cache miss");
            return Lookup::Miss;
        };

        match Self::decode::<T>(&policy, &raw) {
            Ok(value) => {
                self.metrics.record_hit();
                metrics::record_cache_operation(strategy.name(), "hit");
                debug!(strategy = %strategy, key = %key, "Cache hit");

                if policy.refresh_on_access {
                    if let Err(e) = self.store.expire(&full_key, policy.ttl).await {
                        self.record_error(strategy, "refresh", &e);
                    }
                }
                Lookup::Hit(value)
            }
            Err(e) => {
                // An undecodable entry is treated as absent
                self.record_error(strategy, "decode", &e);
                self.metrics.record_miss();
                Lookup::Miss
            }
        }
    }

    /// Look up a cached value
    pub async fn get<T: DeserializeOwned>(&self, strategy: CacheStrategy, key: &str) -> Option<T> {
        match self.lookup(strategy, key).await {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Unavailable => None,
        }
    }

    /// Cache-aside lookup
    ///
    /// On a miss the `fetch` closure is called and a non-empty result is
    /// written back. If the store is unreachable the closure result is
    /// returned without touching the cache. Strategies that do not fall back
    /// to the source never call `fetch`. Only errors from `fetch` itself are
    /// returned.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        strategy: CacheStrategy,
        key: &str,
        fetch: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let policy = self.policy(strategy);
        if !policy.fallback_to_source {
            return Ok(self.get(strategy, key).await);
        }

        match self.lookup(strategy, key).await {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::Miss => {
                let fetched = fetch().await?;
                if let Some(value) = &fetched {
                    self.set(strategy, key, value).await;
                }
                Ok(fetched)
            }
            Lookup::Unavailable => {
                debug!(strategy = %strategy, key = %key, "Store unavailable, reading from source");
                fetch().await
            }
        }
    }

    /// Store a value with the strategy TTL. Returns false if the write failed.
    pub async fn set<T: Serialize + ?Sized>(&self, strategy: CacheStrategy, key: &str, value: &T) -> bool {
        let policy = self.policy(strategy);
        let encoded = match Self::encode(&policy, value) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_error(strategy, "encode", &e);
                return false;
            }
        };

        let full_key = self.full_key(strategy, key);
        let attempts = policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.set_ex(&full_key, &encoded, policy.ttl).await {
                Ok(()) => {
                    self.mark_ok();
                    self.metrics.record_set();
                    metrics::record_cache_operation(strategy.name(), "set");
                    debug!(strategy = %strategy, key = %key, attempt, "Cached value");
                    return true;
                }
                Err(e) => {
                    let unavailable = matches!(e, ControlPlaneError::StoreUnavailable(_));
                    last_error = Some(e);
                    if !unavailable {
                        break;
                    }
                }
            }
        }

        if let Some(e) = last_error {
            self.record_error(strategy, "set", &e);
        }
        false
    }

    /// Delete one entry. Returns true if it existed.
    pub async fn delete(&self, strategy: CacheStrategy, key: &str) -> bool {
        self.delete_many(strategy, &[key]).await > 0
    }

    /// Delete several entries, returning how many existed
    pub async fn delete_many(&self, strategy: CacheStrategy, keys: &[&str]) -> u64 {
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(strategy, k)).collect();
        match self.store.del(&full_keys).await {
            Ok(removed) => {
                self.mark_ok();
                self.metrics.record_deletes(removed);
                removed
            }
            Err(e) => {
                self.record_error(strategy, "delete", &e);
                0
            }
        }
    }

    /// Whether an entry exists
    pub async fn exists(&self, strategy: CacheStrategy, key: &str) -> bool {
        match self.store.exists(&self.full_key(strategy, key)).await {
            Ok(exists) => {
                self.mark_ok();
                exists
            }
            Err(e) => {
                self.record_error(strategy, "exists", &e);
                false
            }
        }
    }

    /// Override the TTL of an entry
    pub async fn expire(&self, strategy: CacheStrategy, key: &str, ttl: Duration) -> bool {
        match self.store.expire(&self.full_key(strategy, key), ttl).await {
            Ok(updated) => {
                self.mark_ok();
                updated
            }
            Err(e) => {
                self.record_error(strategy, "expire", &e);
                false
            }
        }
    }

    /// Remaining lifetime of an entry (`Missing` when the store is down)
    pub async fn time_to_live(&self, strategy: CacheStrategy, key: &str) -> KeyTtl {
        match self.store.ttl(&self.full_key(strategy, key)).await {
            Ok(ttl) => {
                self.mark_ok();
                ttl
            }
            Err(e) => {
                self.record_error(strategy, "ttl", &e);
                KeyTtl::Missing
            }
        }
    }

    /// Delete every entry of a strategy whose raw key matches a glob
    pub async fn clear_pattern(&self, strategy: CacheStrategy, pattern: &str) -> u64 {
        let full_pattern = self.full_key(strategy, pattern);
        let keys = match self.store.keys(&full_pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                self.record_error(strategy, "keys", &e);
                return 0;
            }
        };

        if keys.is_empty() {
            return 0;
        }

        match self.store.del(&keys).await {
            Ok(removed) => {
                self.mark_ok();
                self.metrics.record_deletes(removed);
                info!(strategy = %strategy, pattern = %pattern, removed, "Cleared cache entries");
                removed
            }
            Err(e) => {
                self.record_error(strategy, "clear", &e);
                0
            }
        }
    }

    /// Check store connectivity, surfacing the error
    pub async fn ping(&self) -> Result<()> {
        match self.store.ping().await {
            Ok(()) => {
                self.mark_ok();
                Ok(())
            }
            Err(e) => {
                if self.connected.swap(false, Ordering::Relaxed) {
                    warn!(error = %e, "Key-value store connection lost");
                }
                Err(e)
            }
        }
    }

    /// Last known connectivity, updated by every store round trip
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Current counters
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zero all counters
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        info!("Cache metrics reset");
    }
}
