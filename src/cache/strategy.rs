use crate::error::ControlPlaneError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named cache policies
///
/// The registry is closed: every cache call names one of these variants, so
/// an unknown strategy can only show up when parsing user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// User profiles and plans
    User,
    /// Market quotes and tickers
    Market,
    /// Open positions
    Positions,
    /// Order snapshots
    Orders,
    /// Application configuration
    Config,
    /// Resolved rate limits
    RateLimit,
    /// Session tokens
    Session,
    /// Historical candles and reports
    Historical,
    /// Worker pool snapshots
    Workers,
}

/// Policy attached to a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StrategyPolicy {
    pub name: &'static str,
    #[serde(rename = "ttl_secs", serialize_with = "serialize_secs")]
    pub ttl: Duration,
    pub key_prefix: &'static str,
    /// Store values as JSON. When false, string values are stored raw.
    pub serialize: bool,
    /// Call the source of truth on a miss or when the store is down
    pub fallback_to_source: bool,
    /// Reset the TTL on every hit
    pub refresh_on_access: bool,
    /// Write attempts before giving up on a `set`
    pub max_retries: u32,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl CacheStrategy {
    pub const ALL: [CacheStrategy; 9] = [
        CacheStrategy::User,
        CacheStrategy::Market,
        CacheStrategy::Positions,
        CacheStrategy::Orders,
        CacheStrategy::Config,
        CacheStrategy::RateLimit,
        CacheStrategy::Session,
        CacheStrategy::Historical,
        CacheStrategy::Workers,
    ];

    /// Compiled-in policy for this strategy
    pub const fn policy(self) -> StrategyPolicy {
        match self {
            CacheStrategy::User => StrategyPolicy {
                name: "user",
                ttl: Duration::from_secs(300),
                key_prefix: "user:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: false,
                max_retries: 3,
            },
            CacheStrategy::Market => StrategyPolicy {
                name: "market",
                ttl: Duration::from_secs(30),
                key_prefix: "market:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: false,
                max_retries: 2,
            },
            CacheStrategy::Positions => StrategyPolicy {
                name: "positions",
                ttl: Duration::from_secs(60),
                key_prefix: "positions:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: true,
                max_retries: 3,
            },
            CacheStrategy::Orders => StrategyPolicy {
                name: "orders",
                ttl: Duration::from_secs(60),
                key_prefix: "orders:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: false,
                max_retries: 3,
            },
            CacheStrategy::Config => StrategyPolicy {
                name: "config",
                ttl: Duration::from_secs(600),
                key_prefix: "config:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: false,
                max_retries: 3,
            },
            CacheStrategy::RateLimit => StrategyPolicy {
                name: "rate_limit",
                ttl: Duration::from_secs(60),
                key_prefix: "ratelimit:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: false,
                max_retries: 1,
            },
            CacheStrategy::Session => StrategyPolicy {
                name: "session",
                ttl: Duration::from_secs(3600),
                key_prefix: "session:",
                serialize: false,
                fallback_to_source: false,
                refresh_on_access: true,
                max_retries: 1,
            },
            CacheStrategy::Historical => StrategyPolicy {
                name: "historical",
                ttl: Duration::from_secs(86_400),
                key_prefix: "historical:",
                serialize: true,
                fallback_to_source: true,
                refresh_on_access: false,
                max_retries: 3,
            },
            CacheStrategy::Workers => StrategyPolicy {
                name: "workers",
                ttl: Duration::from_secs(30),
                key_prefix: "workers:",
                serialize: true,
                fallback_to_source: false,
                refresh_on_access: false,
                max_retries: 1,
            },
        }
    }

    /// Strategy name as used in metrics and logs
    pub const fn name(self) -> &'static str {
        self.policy().name
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheStrategy {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_'], "");
        CacheStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name().replace('_', "") == normalized)
            .ok_or_else(|| ControlPlaneError::InvalidStrategy(s.to_string()))
    }
}
