use super::worker::{JobGuard, WorkerNode};
use super::WorkerPool;
use crate::error::{ControlPlaneError, Result};
use crate::metrics;
use backoff::backoff::{Backoff, Constant};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-call execution settings
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Capability the node must declare
    pub capability: Option<String>,
    /// Stable key for hash-based selection
    pub routing_key: Option<String>,
    /// Retries after the first attempt; pool default when None
    pub retries: Option<u32>,
    /// Per-attempt timeout; pool default when None
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl WorkerPool {
    /// Run `job` on a selected node with the pool defaults
    pub async fn execute<F, Fut, T, E>(&self, job: F) -> Result<T>
    where
        F: Fn(Arc<WorkerNode>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.execute_with(job, ExecuteOptions::default()).await
    }

    /// Run `job` on a selected node, retrying on other nodes
    ///
    /// Each attempt reserves a job slot on the node for its whole duration and
    /// runs under the timeout. A timed-out job is abandoned, not cancelled;
    /// its late result is dropped. A node reaching the failure threshold is
    /// taken out of rotation at once. Returns [`ControlPlaneError::NoHealthyWorker`]
    /// if no node was ever eligible and [`ControlPlaneError::WorkerExecutionFailed`]
    /// with the last error once attempts run out.
    pub async fn execute_with<F, Fut, T, E>(&self, job: F, options: ExecuteOptions) -> Result<T>
    where
        F: Fn(Arc<WorkerNode>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let retries = options.retries.unwrap_or(self.config.max_retries);
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let max_attempts = retries.saturating_add(1);
        let capability = options.capability.as_deref();
        let routing_key = options.routing_key.as_deref();

        let mut backoff = Constant::new(self.config.retry_delay());
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<String> = None;
        let mut attempt = 0;

        while attempt < max_attempts {
            attempt += 1;

            let Some((node, guard)) = self.reserve(capability, routing_key, &tried).await else {
                break;
            };
            debug!(attempt, max_attempts, node = %node.id(), "Executing job");

            metrics::record_worker_active_jobs(node.id(), node.active_jobs());
            let started = Instant::now();

            // Spawned so a timeout detaches the job instead of dropping it mid-poll
            let handle = tokio::spawn(job(node.clone()));
            let outcome = match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(join_error)) => Err(format!("job aborted: {}", join_error)),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };

            let elapsed = started.elapsed();
            drop(guard);
            metrics::record_worker_active_jobs(node.id(), node.active_jobs());
            metrics::record_worker_execution(node.id(), outcome.is_ok(), elapsed.as_secs_f64());
            self.stats.record(outcome.is_ok(), elapsed);

            match outcome {
                Ok(value) => {
                    node.record_success(elapsed);
                    if attempt > 1 {
                        debug!(attempt, node = %node.id(), "Job succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(message) => {
                    let failures = node.record_failure();
                    warn!(
                        attempt,
                        max_attempts,
                        node = %node.id(),
                        consecutive_failures = failures,
                        error = %message,
                        "Job attempt failed"
                    );

                    if failures >= self.config.failure_threshold {
                        self.deactivate(&node, "consecutive job failures");
                    }

                    tried.push(node.id().to_string());
                    last_error = Some(message);
                }
            }

            if attempt < max_attempts {
                if let Some(wait) = backoff.next_backoff() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        match last_error {
            Some(message) => {
                warn!(attempts = attempt, error = %message, "Job failed after max retries");
                Err(ControlPlaneError::WorkerExecutionFailed {
                    attempts: tried.len() as u32,
                    message,
                })
            }
            None => Err(ControlPlaneError::NoHealthyWorker(
                capability.unwrap_or("any").to_string(),
            )),
        }
    }

    /// Select a node and reserve a slot on it
    ///
    /// Another caller can fill the selected node between selection and
    /// reservation; the full node is then excluded and selection runs again.
    async fn reserve(
        &self,
        capability: Option<&str>,
        routing_key: Option<&str>,
        tried: &[String],
    ) -> Option<(Arc<WorkerNode>, JobGuard)> {
        let mut exclude = tried.to_vec();
        loop {
            let node = self.select_excluding(capability, routing_key, &exclude).await?;
            if let Some(guard) = node.try_begin_job() {
                return Some((node, guard));
            }
            // Selection fell back to an already excluded node: nothing has room
            if exclude.iter().any(|id| id == node.id()) {
                return None;
            }
            debug!(node = %node.id(), "Worker filled before reservation, reselecting");
            exclude.push(node.id().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{Algorithm, BalancerConfig, WorkerSpec, WorkerStatus};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn spec(id: &str) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            max_jobs: 4,
            capabilities: vec!["orders".to_string()],
            weight: 1,
            managed: false,
        }
    }

    async fn pool(ids: &[&str]) -> WorkerPool {
        let pool = WorkerPool::new(BalancerConfig {
            algorithm: Algorithm::LeastConnections,
            retry_delay_ms: 10,
            timeout_ms: 500,
            ..Default::default()
        })
        .unwrap();
        for id in ids {
            pool.register(spec(id)).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_execute_success() {
        let pool = pool(&["worker-1"]).await;

        let result = pool
            .execute(|node| async move { Ok::<_, String>(node.id().to_string()) })
            .await
            .unwrap();

        assert_eq!(result, "worker-1");
        let node = pool.get("worker-1").await.unwrap();
        assert_eq!(node.active_jobs(), 0);
        assert_eq!(node.snapshot().total_successes, 1);
    }

    #[tokio::test]
    async fn test_active_jobs_tracked_during_execution() {
        let pool = pool(&["worker-1"]).await;

        let observed = pool
            .execute(|node| async move { Ok::<_, String>(node.active_jobs()) })
            .await
            .unwrap();

        assert_eq!(observed, 1);
        assert_eq!(pool.get("worker-1").await.unwrap().active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_retry_moves_to_another_node() {
        let pool = pool(&["worker-1", "worker-2"]).await;

        let result = pool
            .execute(|node| async move {
                if node.id() == "worker-1" {
                    Err("worker-1 is broken".to_string())
                } else {
                    Ok(node.id().to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "worker-2");
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let pool = pool(&["worker-1"]).await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = pool
            .execute_with(
                move |_| {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Err(format!("failure {}", n))
                    }
                },
                ExecuteOptions::new().with_retries(1),
            )
            .await;

        match result {
            Err(ControlPlaneError::WorkerExecutionFailed { attempts, message }) => {
                assert_eq!(attempts, 2);
                assert_eq!(message, "failure 2");
            }
            other => panic!("expected WorkerExecutionFailed, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_two_consecutive_failures_deactivate_node() {
        let pool = pool(&["worker-1", "worker-2"]).await;

        // Every attempt fails: each node fails twice across the retries
        let result: Result<()> = pool
            .execute_with(
                |_| async { Err::<(), _>("boom") },
                ExecuteOptions::new().with_retries(1),
            )
            .await;
        assert!(result.is_err());

        let worker_1 = pool.get("worker-1").await.unwrap();
        assert_eq!(worker_1.consecutive_failures(), 1);
        assert_eq!(worker_1.status(), WorkerStatus::Active);

        let _ = pool
            .execute_with(
                |node| async move {
                    if node.id() == "worker-1" {
                        Err("still broken".to_string())
                    } else {
                        Ok(())
                    }
                },
                ExecuteOptions::new().with_retries(0),
            )
            .await;

        assert_eq!(worker_1.status(), WorkerStatus::Inactive);
        for _ in 0..5 {
            assert_eq!(pool.select_node(None, None).await.unwrap().id(), "worker-2");
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_and_releases_slot() {
        let pool = pool(&["worker-1"]).await;

        let result: Result<()> = pool
            .execute_with(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>(())
                },
                ExecuteOptions::new()
                    .with_retries(0)
                    .with_timeout(Duration::from_millis(50)),
            )
            .await;

        match result {
            Err(ControlPlaneError::WorkerExecutionFailed { message, .. }) => {
                assert!(message.contains("timed out"));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert_eq!(pool.get("worker-1").await.unwrap().active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_no_eligible_node() {
        let pool = pool(&["worker-1"]).await;

        let result: Result<()> = pool
            .execute_with(
                |_| async { Ok::<_, String>(()) },
                ExecuteOptions::new().with_capability("backtest"),
            )
            .await;

        assert!(matches!(result, Err(ControlPlaneError::NoHealthyWorker(c)) if c == "backtest"));
    }

    #[tokio::test]
    async fn test_concurrent_executions_never_exceed_capacity() {
        let pool = Arc::new(
            WorkerPool::new(BalancerConfig {
                algorithm: Algorithm::LeastConnections,
                retry_delay_ms: 10,
                timeout_ms: 500,
                ..Default::default()
            })
            .unwrap(),
        );
        pool.register(WorkerSpec {
            max_jobs: 1,
            ..spec("worker-1")
        })
        .await
        .unwrap();

        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    pool.execute_with(
                        move |node| {
                            let peak = peak.clone();
                            async move {
                                peak.fetch_max(node.active_jobs(), Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok::<_, String>(())
                            }
                        },
                        ExecuteOptions::new().with_retries(0),
                    )
                    .await
                })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(ControlPlaneError::NoHealthyWorker(_)) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }

        assert!(succeeded >= 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get("worker-1").await.unwrap().active_jobs(), 0);
    }
}
