//! Worker pool balancer
//!
//! Keeps the registry of worker nodes, picks a node per unit of work,
//! executes with bounded retries and scales the pool. The registry lock is
//! only held to copy or mutate the node list; selection works on a snapshot
//! and per-node state lives in atomics on [`WorkerNode`].

pub mod executor;
pub mod scaler;
pub mod stats;
pub mod strategies;
pub mod worker;

pub use executor::ExecuteOptions;
pub use scaler::ScaleOutcome;
pub use stats::{BalancerStats, PoolStats, POOL_STATS_KEY};
pub use strategies::{Algorithm, SelectionStrategy};
pub use worker::{JobGuard, WorkerNode, WorkerSnapshot, WorkerSpec, WorkerStatus, WorkerStatusUpdate};

use crate::error::{ControlPlaneError, Result};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Node selection algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before a node is taken out of rotation
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Minimum time between scaling actions in seconds
    #[serde(default = "default_scale_cooldown_secs")]
    pub scale_cooldown_secs: u64,
    #[serde(default = "default_min_nodes")]
    pub min_nodes: usize,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
    /// Template for nodes created by the scaler
    #[serde(default)]
    pub template: WorkerTemplate,
    /// Nodes registered at startup
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_scale_cooldown_secs() -> u64 {
    60
}

fn default_min_nodes() -> usize {
    1
}

fn default_max_nodes() -> usize {
    10
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            scale_cooldown_secs: default_scale_cooldown_secs(),
            min_nodes: default_min_nodes(),
            max_nodes: default_max_nodes(),
            autoscale: AutoscaleConfig::default(),
            template: WorkerTemplate::default(),
            workers: Vec::new(),
        }
    }
}

impl BalancerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn scale_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_cooldown_secs)
    }
}

/// Utilization-driven scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Grow when active jobs / capacity exceeds this
    #[serde(default = "default_scale_up_utilization")]
    pub scale_up_utilization: f64,
    /// Shrink when active jobs / capacity falls below this
    #[serde(default = "default_scale_down_utilization")]
    pub scale_down_utilization: f64,
    /// Nodes added or removed per action
    #[serde(default = "default_scale_step")]
    pub step: usize,
}

fn default_scale_up_utilization() -> f64 {
    0.8
}

fn default_scale_down_utilization() -> f64 {
    0.2
}

fn default_scale_step() -> usize {
    1
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_utilization: default_scale_up_utilization(),
            scale_down_utilization: default_scale_down_utilization(),
            step: default_scale_step(),
        }
    }
}

/// Shape of scaler-created nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTemplate {
    #[serde(default = "default_template_host")]
    pub host: String,
    #[serde(default = "default_template_port")]
    pub port: u16,
    #[serde(default = "default_template_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_template_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_template_weight")]
    pub weight: u32,
}

fn default_template_host() -> String {
    "127.0.0.1".to_string()
}

fn default_template_port() -> u16 {
    9100
}

fn default_template_max_jobs() -> usize {
    10
}

fn default_template_capabilities() -> Vec<String> {
    vec!["general".to_string()]
}

fn default_template_weight() -> u32 {
    1
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            host: default_template_host(),
            port: default_template_port(),
            max_jobs: default_template_max_jobs(),
            capabilities: default_template_capabilities(),
            weight: default_template_weight(),
        }
    }
}

/// Registry of worker nodes plus selection, execution and scaling
pub struct WorkerPool {
    nodes: RwLock<Vec<Arc<WorkerNode>>>,
    strategy: SelectionStrategy,
    config: BalancerConfig,
    stats: BalancerStats,
    /// Time of the last scaling action; also serializes scaling
    last_scale: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("algorithm", &self.strategy.algorithm())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool and register the configured static workers
    pub fn new(config: BalancerConfig) -> Result<Self> {
        let mut nodes: Vec<Arc<WorkerNode>> = Vec::with_capacity(config.workers.len());
        for spec in &config.workers {
            validate_spec(spec)?;
            if nodes.iter().any(|n| n.id() == spec.id) {
                return Err(ControlPlaneError::Config(format!(
                    "duplicate worker id '{}'",
                    spec.id
                )));
            }
            nodes.push(Arc::new(WorkerNode::new(spec.clone())));
        }

        info!(
            algorithm = %config.algorithm,
            workers = nodes.len(),
            "Initialized worker pool"
        );

        Ok(Self {
            nodes: RwLock::new(nodes),
            strategy: SelectionStrategy::new(config.algorithm),
            config,
            stats: BalancerStats::new(),
            last_scale: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn algorithm(&self) -> Algorithm {
        self.strategy.algorithm()
    }

    pub(crate) fn balancer_stats(&self) -> &BalancerStats {
        &self.stats
    }

    /// Snapshot of the registry in registration order
    pub async fn nodes(&self) -> Vec<Arc<WorkerNode>> {
        self.nodes.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<WorkerNode>> {
        self.nodes.read().await.iter().find(|n| n.id() == id).cloned()
    }

    pub async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.nodes().await.iter().map(|n| n.snapshot()).collect()
    }

    /// Register a node. Registering an id that already exists returns the
    /// existing node unchanged.
    pub async fn register(&self, spec: WorkerSpec) -> Result<Arc<WorkerNode>> {
        validate_spec(&spec)?;

        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.iter().find(|n| n.id() == spec.id) {
            debug!(node = %spec.id, "Worker already registered");
            return Ok(existing.clone());
        }

        let node = Arc::new(WorkerNode::new(spec));
        nodes.push(node.clone());
        let total = nodes.len();
        drop(nodes);

        info!(node = %node.id(), address = %node.address(), total, "Registered worker");
        metrics::record_worker_health(node.id(), true);
        Ok(node)
    }

    /// Remove a node. Returns false if it was not registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        let before = nodes.len();
        nodes.retain(|n| n.id() != id);
        let removed = nodes.len() < before;
        drop(nodes);

        if removed {
            info!(node = %id, "Unregistered worker");
        }
        removed
    }

    /// Merge a partial status update into a node
    pub async fn update_status(&self, id: &str, update: WorkerStatusUpdate) -> Result<WorkerSnapshot> {
        let node = self
            .get(id)
            .await
            .ok_or_else(|| ControlPlaneError::WorkerNotFound(id.to_string()))?;

        node.apply(&update);
        if let Some(status) = update.status {
            info!(node = %id, ?status, "Worker status updated");
            metrics::record_worker_health(id, status != WorkerStatus::Inactive);
        }
        Ok(node.snapshot())
    }

    /// Select a node able to take work
    ///
    /// Inactive and saturated nodes are skipped, as are nodes lacking the
    /// requested capability. None means no capacity, not an error.
    pub async fn select_node(
        &self,
        capability: Option<&str>,
        routing_key: Option<&str>,
    ) -> Option<Arc<WorkerNode>> {
        self.select_excluding(capability, routing_key, &[]).await
    }

    /// Like [`select_node`](Self::select_node), preferring nodes not in
    /// `exclude` when any other candidate exists
    pub(crate) async fn select_excluding(
        &self,
        capability: Option<&str>,
        routing_key: Option<&str>,
        exclude: &[String],
    ) -> Option<Arc<WorkerNode>> {
        let nodes = self.nodes().await;

        let eligible: Vec<&Arc<WorkerNode>> = nodes
            .iter()
            .filter(|n| n.is_available())
            .filter(|n| capability.map_or(true, |c| n.has_capability(c)))
            .collect();

        let fresh: Vec<&Arc<WorkerNode>> = eligible
            .iter()
            .copied()
            .filter(|n| !exclude.iter().any(|id| id == n.id()))
            .collect();
        let candidates = if fresh.is_empty() { eligible } else { fresh };

        let selected = self.strategy.select(&candidates, routing_key).cloned();
        match &selected {
            Some(node) => debug!(
                node = %node.id(),
                active_jobs = node.active_jobs(),
                candidates = candidates.len(),
                "Selected worker"
            ),
            None => warn!(capability = ?capability, "No eligible worker"),
        }
        selected
    }

    /// Take a node out of rotation
    pub(crate) fn deactivate(&self, node: &WorkerNode, reason: &str) {
        node.set_status(WorkerStatus::Inactive);
        metrics::record_worker_health(node.id(), false);
        warn!(node = %node.id(), reason, "Worker marked inactive");
    }
}

pub(crate) fn validate_spec(spec: &WorkerSpec) -> Result<()> {
    if spec.id.trim().is_empty() {
        return Err(ControlPlaneError::InvalidRequest("worker id must not be empty".to_string()));
    }
    if spec.max_jobs == 0 {
        return Err(ControlPlaneError::InvalidRequest(format!(
            "worker '{}' must accept at least one job",
            spec.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, capabilities: &[&str]) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            max_jobs: 10,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            weight: 1,
            managed: false,
        }
    }

    fn pool(algorithm: Algorithm) -> WorkerPool {
        WorkerPool::new(BalancerConfig {
            algorithm,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let pool = pool(Algorithm::RoundRobin);

        let first = pool.register(spec("worker-1", &["orders"])).await.unwrap();
        let second = pool.register(spec("worker-1", &["orders"])).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let pool = pool(Algorithm::RoundRobin);
        pool.register(spec("worker-1", &[])).await.unwrap();

        assert!(pool.unregister("worker-1").await);
        assert!(!pool.unregister("worker-1").await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected() {
        let pool = pool(Algorithm::RoundRobin);
        let mut bad = spec("worker-1", &[]);
        bad.max_jobs = 0;

        assert!(matches!(pool.register(bad).await, Err(ControlPlaneError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_capability_filter() {
        let pool = pool(Algorithm::RoundRobin);
        pool.register(spec("orders-1", &["orders"])).await.unwrap();
        pool.register(spec("backtest-1", &["backtest"])).await.unwrap();

        for _ in 0..5 {
            let node = pool.select_node(Some("backtest"), None).await.unwrap();
            assert_eq!(node.id(), "backtest-1");
        }
        assert!(pool.select_node(Some("reporting"), None).await.is_none());
    }

    #[tokio::test]
    async fn test_update_status_unknown_node() {
        let pool = pool(Algorithm::RoundRobin);
        let result = pool
            .update_status("ghost", WorkerStatusUpdate::default())
            .await;
        assert!(matches!(result, Err(ControlPlaneError::WorkerNotFound(_))));
    }

    #[tokio::test]
    async fn test_inactive_node_never_selected() {
        let pool = pool(Algorithm::RoundRobin);
        pool.register(spec("worker-1", &[])).await.unwrap();
        pool.register(spec("worker-2", &[])).await.unwrap();

        pool.update_status(
            "worker-1",
            WorkerStatusUpdate {
                status: Some(WorkerStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        for _ in 0..6 {
            assert_eq!(pool.select_node(None, None).await.unwrap().id(), "worker-2");
        }
    }

    #[tokio::test]
    async fn test_exclusion_prefers_other_nodes() {
        let pool = pool(Algorithm::LeastConnections);
        pool.register(spec("worker-1", &[])).await.unwrap();
        pool.register(spec("worker-2", &[])).await.unwrap();

        let excluded = vec!["worker-1".to_string()];
        let node = pool.select_excluding(None, None, &excluded).await.unwrap();
        assert_eq!(node.id(), "worker-2");

        // Only the excluded node left: it is still used
        pool.unregister("worker-2").await;
        let node = pool.select_excluding(None, None, &excluded).await.unwrap();
        assert_eq!(node.id(), "worker-1");
    }

    #[tokio::test]
    async fn test_static_workers_registered() {
        let pool = WorkerPool::new(BalancerConfig {
            workers: vec![spec("worker-1", &[]), spec("worker-2", &[])],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(pool.len().await, 2);

        let duplicate = WorkerPool::new(BalancerConfig {
            workers: vec![spec("worker-1", &[]), spec("worker-1", &[])],
            ..Default::default()
        });
        assert!(duplicate.is_err());
    }
}
