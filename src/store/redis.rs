use super::lua_scripts::FIXED_WINDOW_SCRIPT;
use super::{KeyTtl, KeyValueStore, WindowCount};
use crate::error::{ControlPlaneError, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use redis::{aio::ConnectionManager, Script};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Number of keys requested per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Upper bound between reconnect attempts while Redis is unreachable
const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

struct Inner {
    client: redis::Client,
    /// Set once the first connection succeeds; the manager reconnects on its own after that
    connection: OnceCell<ConnectionManager>,
    fixed_window: Script,
}

/// Redis-backed key-value store
///
/// Until the first connection is established every operation fails with
/// `StoreUnavailable`, which callers already absorb.
#[derive(Clone)]
pub struct RedisStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"<redis::aio::ConnectionManager>")
            .field("connected", &self.is_established())
            .finish()
    }
}

impl RedisStore {
    fn from_client(client: redis::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                connection: OnceCell::new(),
                fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            }),
        }
    }

    /// Connect to Redis, failing if the first connection cannot be made
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let store = Self::from_client(redis::Client::open(redis_url)?);
        let connection = ConnectionManager::new(store.inner.client.clone()).await?;
        let _ = store.inner.connection.set(connection);

        info!("Connected to Redis key-value store");
        Ok(store)
    }

    /// Connect to Redis, starting degraded when it is unreachable
    ///
    /// Only a malformed URL is an error. When the first connection fails a
    /// background task keeps retrying with exponential backoff until it
    /// succeeds or the store is dropped.
    pub async fn connect_or_degrade(redis_url: &str) -> Result<Self> {
        let store = Self::from_client(redis::Client::open(redis_url)?);

        match ConnectionManager::new(store.inner.client.clone()).await {
            Ok(connection) => {
                let _ = store.inner.connection.set(connection);
                info!("Connected to Redis key-value store");
            }
            Err(e) => {
                warn!(error = %e, "Redis unreachable at startup, continuing degraded");
                Self::spawn_reconnect(Arc::downgrade(&store.inner));
            }
        }

        Ok(store)
    }

    /// Whether a connection has ever been established
    pub fn is_established(&self) -> bool {
        self.inner.connection.initialized()
    }

    fn spawn_reconnect(inner: Weak<Inner>) {
        tokio::spawn(async move {
            let mut backoff = ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(500))
                .with_max_interval(MAX_RECONNECT_INTERVAL)
                .with_max_elapsed_time(None)
                .build();

            loop {
                let wait = backoff.next_backoff().unwrap_or(MAX_RECONNECT_INTERVAL);
                tokio::time::sleep(wait).await;

                let Some(inner) = inner.upgrade() else {
                    debug!("Redis store dropped, stopping reconnect loop");
                    return;
                };

                match ConnectionManager::new(inner.client.clone()).await {
                    Ok(connection) => {
                        let _ = inner.connection.set(connection);
                        info!("Connected to Redis key-value store");
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "Redis still unreachable");
                    }
                }
            }
        });
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.inner.connection.get().cloned().ok_or_else(|| {
            ControlPlaneError::StoreUnavailable("Redis connection not established".to_string())
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let removed: u64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection()?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection()?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match pttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, matched = found.len(), "Scanned keys");
        Ok(found)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.connection()?;
        let window_ms = window.as_millis().max(1) as u64;
        let result: Vec<i64> = self
            .inner
            .fixed_window
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        let count = result.first().copied().unwrap_or(1).max(0) as u64;
        let reset_ms = result.get(1).copied().unwrap_or(window_ms as i64).max(0) as u64;

        Ok(WindowCount {
            count,
            reset_after: Duration::from_millis(reset_ms),
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
