use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Worker node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Overloaded,
}

impl WorkerStatus {
    const fn as_u8(self) -> u8 {
        match self {
            WorkerStatus::Active => 0,
            WorkerStatus::Inactive => 1,
            WorkerStatus::Overloaded => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerStatus::Active,
            2 => WorkerStatus::Overloaded,
            _ => WorkerStatus::Inactive,
        }
    }
}

/// Worker node registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Unique node id
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Concurrent job capacity
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Job kinds this node accepts
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Weight for weighted round-robin (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Created by the scaler rather than registered by an operator
    #[serde(default)]
    pub managed: bool,
}

fn default_max_jobs() -> usize {
    10
}

fn default_weight() -> u32 {
    1
}

/// Partial status update, merged field by field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatusUpdate {
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub active_jobs: Option<usize>,
}

/// Worker node state
///
/// The registration is immutable; everything the health loop and the
/// executor touch is a separate atomic so concurrent updates merge instead
/// of overwriting each other.
#[derive(Debug)]
pub struct WorkerNode {
    spec: WorkerSpec,
    status: AtomicU8,
    /// f64 bits
    cpu_usage: AtomicU64,
    /// f64 bits
    memory_usage: AtomicU64,
    active_jobs: AtomicUsize,
    consecutive_failures: AtomicU32,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    response_time_ms: AtomicU64,
    /// Unix epoch millis, 0 = never checked
    last_health_check: AtomicI64,
    registered_at: DateTime<Utc>,
}

impl WorkerNode {
    /// Create a new node from its registration. Nodes start active.
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            status: AtomicU8::new(WorkerStatus::Active.as_u8()),
            cpu_usage: AtomicU64::new(0f64.to_bits()),
            memory_usage: AtomicU64::new(0f64.to_bits()),
            active_jobs: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            response_time_ms: AtomicU64::new(0),
            last_health_check: AtomicI64::new(0),
            registered_at: Utc::now(),
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Base URL of the node
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.spec.host, self.spec.port)
    }

    pub fn max_jobs(&self) -> usize {
        self.spec.max_jobs
    }

    pub fn weight(&self) -> u32 {
        self.spec.weight
    }

    pub fn is_managed(&self) -> bool {
        self.spec.managed
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.spec.capabilities.iter().any(|c| c == capability)
    }

    /// Status as reported: an active node at capacity reads as overloaded
    pub fn status(&self) -> WorkerStatus {
        match WorkerStatus::from_u8(self.status.load(Ordering::Relaxed)) {
            WorkerStatus::Active if self.is_saturated() => WorkerStatus::Overloaded,
            status => status,
        }
    }

    pub fn set_status(&self, status: WorkerStatus) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }

    pub fn is_inactive(&self) -> bool {
        WorkerStatus::from_u8(self.status.load(Ordering::Relaxed)) == WorkerStatus::Inactive
    }

    fn is_saturated(&self) -> bool {
        self.active_jobs() >= self.spec.max_jobs
    }

    /// Whether the node may receive new work
    pub fn is_available(&self) -> bool {
        self.status() == WorkerStatus::Active
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }

    pub fn cpu_usage(&self) -> f64 {
        f64::from_bits(self.cpu_usage.load(Ordering::Relaxed))
    }

    pub fn memory_usage(&self) -> f64 {
        f64::from_bits(self.memory_usage.load(Ordering::Relaxed))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms.load(Ordering::Relaxed))
    }

    /// Reserve a job slot; released when the guard drops
    ///
    /// The check against `max_jobs` and the increment are one atomic step, so
    /// concurrent callers can never push the node past capacity. Returns
    /// `None` when the node is full.
    pub fn try_begin_job(self: &Arc<Self>) -> Option<JobGuard> {
        let max_jobs = self.spec.max_jobs;
        self.active_jobs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_jobs).then_some(n + 1)
            })
            .ok()?;
        Some(JobGuard { node: self.clone() })
    }

    fn end_job(&self) {
        let _ = self
            .active_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Record a successful job
    pub fn record_success(&self, latency: Duration) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.response_time_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a failed job, returning the consecutive failure count
    pub fn record_failure(&self) -> u32 {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a health check result
    pub fn record_health_check(&self, latency: Option<Duration>) {
        self.last_health_check
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        match latency {
            Some(latency) => {
                self.set_status(WorkerStatus::Active);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.response_time_ms
                    .store(latency.as_millis() as u64, Ordering::Relaxed);
            }
            None => self.set_status(WorkerStatus::Inactive),
        }
    }

    /// Merge a partial update into the node
    pub fn apply(&self, update: &WorkerStatusUpdate) {
        if let Some(status) = update.status {
            self.set_status(status);
        }
        if let Some(cpu) = update.cpu_usage {
            self.cpu_usage.store(cpu.to_bits(), Ordering::Relaxed);
        }
        if let Some(memory) = update.memory_usage {
            self.memory_usage.store(memory.to_bits(), Ordering::Relaxed);
        }
        if let Some(jobs) = update.active_jobs {
            self.active_jobs.store(jobs, Ordering::Relaxed);
        }
    }

    /// Point-in-time view of the node
    pub fn snapshot(&self) -> WorkerSnapshot {
        let last_check = self.last_health_check.load(Ordering::Relaxed);
        WorkerSnapshot {
            id: self.spec.id.clone(),
            host: self.spec.host.clone(),
            port: self.spec.port,
            status: self.status(),
            capabilities: self.spec.capabilities.clone(),
            weight: self.spec.weight,
            max_jobs: self.spec.max_jobs,
            active_jobs: self.active_jobs(),
            cpu_usage: self.cpu_usage(),
            memory_usage: self.memory_usage(),
            consecutive_failures: self.consecutive_failures(),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            response_time_ms: self.response_time_ms.load(Ordering::Relaxed),
            last_health_check: (last_check > 0)
                .then(|| Utc.timestamp_millis_opt(last_check).single())
                .flatten(),
            registered_at: self.registered_at,
            managed: self.spec.managed,
        }
    }
}

/// Releases a job slot on every exit path
#[derive(Debug)]
pub struct JobGuard {
    node: Arc<WorkerNode>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.node.end_job();
    }
}

/// Serializable view of a worker node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub capabilities: Vec<String>,
    pub weight: u32,
    pub max_jobs: usize,
    pub active_jobs: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub response_time_ms: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub managed: bool,
}
