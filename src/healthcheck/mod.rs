use crate::balancer::{WorkerNode, WorkerPool};
use crate::cache::CacheEngine;
use crate::error::{ControlPlaneError, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Enable health checks
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Interval between health checks in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Per-check timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// HTTP path to check (e.g., "/health")
    #[serde(default = "default_path")]
    pub path: String,
    /// Expected HTTP status code
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_path() -> String {
    "/health".to_string()
}

fn default_expected_status() -> u16 {
    200
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval(),
            timeout_ms: default_timeout_ms(),
            path: default_path(),
            expected_status: default_expected_status(),
        }
    }
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Reachability check for a single node
#[async_trait]
pub trait NodeCheck: Send + Sync {
    /// Check the node, returning an error describing why it is unreachable
    async fn check(&self, node: &WorkerNode) -> std::result::Result<(), String>;
}

/// HTTP GET against the node's health path
pub struct HttpCheck {
    client: reqwest::Client,
    path: String,
    expected_status: u16,
}

impl std::fmt::Debug for HttpCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCheck")
            .field("path", &self.path)
            .field("expected_status", &self.expected_status)
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl HttpCheck {
    pub fn new(config: &HealthCheckConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                ControlPlaneError::Internal(format!("Failed to create health check client: {}", e))
            })?;

        Ok(Self {
            client,
            path: config.path.clone(),
            expected_status: config.expected_status,
        })
    }
}

#[async_trait]
impl NodeCheck for HttpCheck {
    async fn check(&self, node: &WorkerNode) -> std::result::Result<(), String> {
        let url = format!("{}{}", node.address(), self.path);
        debug!(url = %url, "Performing health check");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("request error: {}", e))?;

        let status = response.status();
        if status.as_u16() == self.expected_status {
            Ok(())
        } else {
            Err(format!(
                "unexpected status {} (expected {})",
                status, self.expected_status
            ))
        }
    }
}

/// Summary of one health check pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Periodic health checker for worker nodes
pub struct HealthChecker {
    config: HealthCheckConfig,
    check: Arc<dyn NodeCheck>,
    stats_cache: Option<Arc<CacheEngine>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("publishes_stats", &self.stats_cache.is_some())
            .finish()
    }
}

impl HealthChecker {
    /// Create a health checker that checks over HTTP
    pub fn new(config: HealthCheckConfig) -> Result<Self> {
        let check = Arc::new(HttpCheck::new(&config)?);
        Ok(Self::with_check(config, check))
    }

    /// Create a health checker with a custom check
    pub fn with_check(config: HealthCheckConfig, check: Arc<dyn NodeCheck>) -> Self {
        Self {
            config,
            check,
            stats_cache: None,
        }
    }

    /// Publish pool statistics through the cache after every pass
    pub fn with_stats_cache(mut self, cache: Arc<CacheEngine>) -> Self {
        self.stats_cache = Some(cache);
        self
    }

    /// Get health check configuration
    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Check one node and record the result on it
    pub async fn check_node(&self, node: &WorkerNode) -> bool {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.timeout(), self.check.check(node)).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {}ms", self.config.timeout_ms)),
        };

        let was_inactive = node.is_inactive();
        match outcome {
            Ok(()) => {
                let latency = started.elapsed();
                node.record_health_check(Some(latency));
                metrics::record_worker_health(node.id(), true);
                if was_inactive {
                    info!(node = %node.id(), latency_ms = latency.as_millis() as u64, "Worker recovered");
                } else {
                    debug!(node = %node.id(), latency_ms = latency.as_millis() as u64, "Health check passed");
                }
                true
            }
            Err(reason) => {
                node.record_health_check(None);
                metrics::record_worker_health(node.id(), false);
                warn!(node = %node.id(), reason = %reason, "Health check failed");
                false
            }
        }
    }

    /// Check every registered node concurrently
    pub async fn check_all(&self, pool: &WorkerPool) -> HealthReport {
        let nodes = pool.nodes().await;
        let results = join_all(nodes.iter().map(|node| self.check_node(node))).await;

        let healthy = results.iter().filter(|ok| **ok).count();
        HealthReport {
            checked: results.len(),
            healthy,
            unhealthy: results.len() - healthy,
        }
    }

    /// One pass: check nodes, let the autoscaler react, publish stats
    pub async fn tick(&self, pool: &WorkerPool) -> HealthReport {
        let report = self.check_all(pool).await;

        if let Some(outcome) = pool.autoscale_tick().await {
            debug!(?outcome, "Autoscale outcome");
        }
        if let Some(cache) = &self.stats_cache {
            pool.publish_stats(cache).await;
        }

        report
    }

    /// Start the periodic loop. Returns None when checks are disabled.
    pub fn start(self: Arc<Self>, pool: Arc<WorkerPool>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Active health checks disabled");
            return None;
        }

        let handle = tokio::spawn(async move {
            let mut check_interval = interval(Duration::from_secs(self.config.interval_secs.max(1)));

            info!(
                interval_secs = self.config.interval_secs,
                path = %self.config.path,
                "Started active health checks"
            );

            loop {
                check_interval.tick().await;
                let report = self.tick(&pool).await;
                debug!(
                    checked = report.checked,
                    healthy = report.healthy,
                    unhealthy = report.unhealthy,
                    "Health check pass complete"
                );
            }
        });

        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{BalancerConfig, WorkerSpec, WorkerStatus};
    use std::collections::HashSet;

    /// Check failing for a fixed set of node ids
    struct StaticCheck {
        down: HashSet<String>,
    }

    #[async_trait]
    impl NodeCheck for StaticCheck {
        async fn check(&self, node: &WorkerNode) -> std::result::Result<(), String> {
            if self.down.contains(node.id()) {
                Err("connection refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl NodeCheck for HangingCheck {
        async fn check(&self, _node: &WorkerNode) -> std::result::Result<(), String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    async fn pool_with(ids: &[&str]) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(BalancerConfig::default()).unwrap());
        for id in ids {
            pool.register(WorkerSpec {
                id: id.to_string(),
                host: "127.0.0.1".to_string(),
                port: 9000,
                max_jobs: 4,
                capabilities: vec![],
                weight: 1,
                managed: false,
            })
            .await
            .unwrap();
        }
        pool
    }

    #[test]
    fn test_default_config() {
        let config = HealthCheckConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.path, "/health");
        assert_eq!(config.expected_status, 200);
    }

    #[tokio::test]
    async fn test_check_all_updates_status() {
        let pool = pool_with(&["worker-1", "worker-2"]).await;
        let checker = HealthChecker::with_check(
            HealthCheckConfig::default(),
            Arc::new(StaticCheck {
                down: HashSet::from(["worker-2".to_string()]),
            }),
        );

        let report = checker.check_all(&pool).await;
        assert_eq!(
            report,
            HealthReport {
                checked: 2,
                healthy: 1,
                unhealthy: 1
            }
        );
        assert_eq!(pool.get("worker-1").await.unwrap().status(), WorkerStatus::Active);
        assert_eq!(pool.get("worker-2").await.unwrap().status(), WorkerStatus::Inactive);
    }

    #[tokio::test]
    async fn test_recovered_node_reactivated() {
        let pool = pool_with(&["worker-1"]).await;
        let node = pool.get("worker-1").await.unwrap();
        node.set_status(WorkerStatus::Inactive);

        let checker = HealthChecker::with_check(
            HealthCheckConfig::default(),
            Arc::new(StaticCheck {
                down: HashSet::new(),
            }),
        );
        assert!(checker.check_node(&node).await);
        assert_eq!(node.status(), WorkerStatus::Active);
    }

    #[tokio::test]
    async fn test_check_timeout_marks_inactive() {
        let pool = pool_with(&["worker-1"]).await;
        let checker = HealthChecker::with_check(
            HealthCheckConfig {
                timeout_ms: 20,
                ..Default::default()
            },
            Arc::new(HangingCheck),
        );

        let report = checker.check_all(&pool).await;
        assert_eq!(report.unhealthy, 1);
        assert!(pool.get("worker-1").await.unwrap().is_inactive());
    }

    #[tokio::test]
    async fn test_disabled_checks_do_not_start() {
        let pool = pool_with(&[]).await;
        let checker = Arc::new(HealthChecker::with_check(
            HealthCheckConfig {
                enabled: false,
                ..Default::default()
            },
            Arc::new(HangingCheck),
        ));

        assert!(checker.start(pool).is_none());
    }

    #[tokio::test]
    async fn test_loop_runs_in_background() {
        let pool = pool_with(&["worker-1"]).await;
        let checker = Arc::new(HealthChecker::with_check(
            HealthCheckConfig {
                interval_secs: 1,
                ..Default::default()
            },
            Arc::new(StaticCheck {
                down: HashSet::from(["worker-1".to_string()]),
            }),
        ));

        let handle = checker.start(pool.clone()).unwrap();
        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(pool.get("worker-1").await.unwrap().is_inactive());
    }
}
