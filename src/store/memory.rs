use super::{KeyTtl, KeyValueStore, WindowCount};
use crate::error::{ControlPlaneError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process key-value store with per-key expiry
///
/// Expired keys are dropped lazily on access. [`MemoryStore::set_available`]
/// makes every operation fail with `StoreUnavailable`, which is how tests
/// exercise degraded paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("Memory store marked unavailable");
        }
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the store holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ControlPlaneError::StoreUnavailable(
                "memory store is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a live entry, evicting it if it has expired
    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.entries.get(key).map(|e| e.clone())?;
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

/// Translate a Redis-style glob into an anchored regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| ControlPlaneError::Internal(format!("Invalid pattern: {}", e)))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.live_entry(key).map(|e| e.value))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.check_available()?;
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, e)| !e.is_expired(now))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.live_entry(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check_available()?;
        let now = Instant::now();
        Ok(match self.live_entry(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();

        debug!(pattern = %pattern, matched = keys.len(), "Matched keys");
        Ok(keys)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        self.check_available()?;
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: Some(now + window),
            });

        if entry.is_expired(now) {
            entry.value = "0".to_string();
            entry.expires_at = Some(now + window);
        }

        let count = entry.value.parse::<u64>().unwrap_or(0) + 1;
        entry.value = count.to_string();
        let expires_at = *entry.expires_at.get_or_insert(now + window);

        Ok(WindowCount {
            count,
            reset_after: expires_at.saturating_duration_since(now),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
