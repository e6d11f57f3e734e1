use super::worker::WorkerStatus;
use super::WorkerPool;
use crate::cache::{CacheEngine, CacheStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Cache key of the published pool snapshot (`workers` strategy)
pub const POOL_STATS_KEY: &str = "pool:stats";

/// Cumulative execution counters, reset only by restart
#[derive(Debug)]
pub struct BalancerStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time_ms: AtomicU64,
    started_at: DateTime<Utc>,
}

impl BalancerStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record(&self, success: bool, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for BalancerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub algorithm: String,
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub inactive_nodes: usize,
    pub overloaded_nodes: usize,
    /// Share of nodes not inactive
    pub health_ratio: f64,
    pub active_jobs: usize,
    pub capacity: usize,
    /// Active jobs over the capacity of nodes not inactive
    pub utilization: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

fn ratio(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole
    } else {
        0.0
    }
}

impl WorkerPool {
    /// Current statistics; one pass over the registry
    pub async fn stats(&self) -> PoolStats {
        let nodes = self.nodes().await;

        let mut active_nodes = 0;
        let mut inactive_nodes = 0;
        let mut overloaded_nodes = 0;
        let mut active_jobs = 0;
        let mut capacity = 0;
        for node in &nodes {
            match node.status() {
                WorkerStatus::Active => active_nodes += 1,
                WorkerStatus::Inactive => inactive_nodes += 1,
                WorkerStatus::Overloaded => overloaded_nodes += 1,
            }
            if !node.is_inactive() {
                active_jobs += node.active_jobs();
                capacity += node.max_jobs();
            }
        }

        let counters = self.balancer_stats();
        let total_requests = counters.total_requests.load(Ordering::Relaxed);
        let successful_requests = counters.successful_requests.load(Ordering::Relaxed);
        let failed_requests = counters.failed_requests.load(Ordering::Relaxed);
        let total_response_time_ms = counters.total_response_time_ms.load(Ordering::Relaxed);

        PoolStats {
            algorithm: self.algorithm().to_string(),
            total_nodes: nodes.len(),
            active_nodes,
            inactive_nodes,
            overloaded_nodes,
            health_ratio: ratio((nodes.len() - inactive_nodes) as f64, nodes.len() as f64),
            active_jobs,
            capacity,
            utilization: ratio(active_jobs as f64, capacity as f64),
            total_requests,
            successful_requests,
            failed_requests,
            success_rate: ratio(successful_requests as f64, total_requests as f64),
            average_response_time_ms: ratio(total_response_time_ms as f64, total_requests as f64),
            started_at: counters.started_at,
            uptime_secs: (Utc::now() - counters.started_at).num_seconds(),
        }
    }

    /// Write the current statistics through the `workers` cache strategy
    pub async fn publish_stats(&self, cache: &CacheEngine) -> bool {
        let stats = self.stats().await;
        let published = cache.set(CacheStrategy::Workers, POOL_STATS_KEY, &stats).await;
        debug!(published, nodes = stats.total_nodes, "Published pool stats");
        published
    }
}
