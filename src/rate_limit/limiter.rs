use super::types::RateLimitKey;
use crate::store::{KeyTtl, KeyValueStore, WindowCount};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Local windows kept before expired ones are swept
const LOCAL_SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    expires_at: Instant,
}

/// Fixed-window counters in the shared store
///
/// Counters live in the key-value store so every instance sees the same
/// window. While the store is unreachable counting continues in process,
/// which keeps enforcement on (per instance) instead of failing open.
pub struct FixedWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    local: DashMap<String, LocalWindow>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("namespace", &self.namespace)
            .field("local_windows", &self.local.len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            local: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether counting currently happens in process
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Number of in-process windows (for testing/monitoring)
    pub fn local_windows(&self) -> usize {
        self.local.len()
    }

    fn store_ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("Rate limit counters back on the shared store");
        }
    }

    fn store_failed(&self, err: &crate::error::ControlPlaneError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(error = %err, "Rate limit store unavailable, counting in process");
        }
    }

    /// Count one hit against the window
    pub async fn hit(&self, key: &RateLimitKey, window: Duration) -> WindowCount {
        let store_key = key.to_store_key(&self.namespace);
        match self.store.incr_window(&store_key, window).await {
            Ok(count) => {
                self.store_ok();
                count
            }
            Err(e) => {
                self.store_failed(&e);
                self.local_hit(store_key, window)
            }
        }
    }

    /// Current window state without counting
    pub async fn peek(&self, key: &RateLimitKey, window: Duration) -> WindowCount {
        let store_key = key.to_store_key(&self.namespace);

        let count = match self.store.get(&store_key).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0),
            Err(e) => {
                self.store_failed(&e);
                return self.local_peek(&store_key, window);
            }
        };

        let reset_after = match self.store.ttl(&store_key).await {
            Ok(KeyTtl::Expires(remaining)) => remaining,
            Ok(KeyTtl::Missing | KeyTtl::Persistent) => window,
            Err(e) => {
                self.store_failed(&e);
                return self.local_peek(&store_key, window);
            }
        };

        self.store_ok();
        WindowCount { count, reset_after }
    }

    fn local_hit(&self, store_key: String, window: Duration) -> WindowCount {
        let now = Instant::now();
        if self.local.len() > LOCAL_SWEEP_THRESHOLD {
            self.local.retain(|_, w| w.expires_at > now);
        }

        let mut entry = self.local.entry(store_key).or_insert(LocalWindow {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;

        debug!(count = entry.count, "Counted hit in process");
        WindowCount {
            count: entry.count,
            reset_after: entry.expires_at.saturating_duration_since(now),
        }
    }

    fn local_peek(&self, store_key: &str, window: Duration) -> WindowCount {
        let now = Instant::now();
        match self.local.get(store_key) {
            Some(w) if w.expires_at > now => WindowCount {
                count: w.count,
                reset_after: w.expires_at.saturating_duration_since(now),
            },
            _ => WindowCount {
                count: 0,
                reset_after: window,
            },
        }
    }
}
