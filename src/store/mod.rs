//! Shared key-value store abstraction
//!
//! The cache engine and the fixed-window rate limiter only need a small
//! slice of a Redis-like store. [`KeyValueStore`] captures that slice so the
//! control plane can run against:
//!
//! - [`RedisStore`]: the production backend (connection manager + Lua)
//! - [`MemoryStore`]: an in-process backend used in development and tests,
//!   with a switch to simulate the store going away
//!
//! Every method returns [`ControlPlaneError::StoreUnavailable`] when the
//! store cannot be reached. Callers decide whether to absorb it.
//!
//! [`ControlPlaneError::StoreUnavailable`]: crate::error::ControlPlaneError::StoreUnavailable

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Remaining lifetime of a key, mirroring Redis `PTTL` semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "ttl_ms")]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the given duration
    Expires(#[serde(serialize_with = "serialize_millis")] Duration),
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Counter state of a fixed window after an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Number of hits recorded in the current window
    pub count: u64,
    /// Time until the window resets
    pub reset_after: Duration,
}

/// Minimal interface the control plane requires from the shared store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a time-to-live
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Check whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reset the time-to-live of a key. Returns false if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time-to-live of a key
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// List keys matching a glob pattern (`*`, `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomically increment a fixed-window counter, starting the window on
    /// the first hit
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount>;

    /// Round trip to check connectivity
    async fn ping(&self) -> Result<()>;
}
