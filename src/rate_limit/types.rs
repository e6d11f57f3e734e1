use crate::error::{ControlPlaneError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Deployment environment a rate limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
    /// Applies to every environment without a more specific record
    Global,
}

impl Environment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Global => "global",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            "global" => Ok(Environment::Global),
            _ => Err(ControlPlaneError::InvalidEnvironment(s.to_string())),
        }
    }
}

/// Coarse traffic category sharing one rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Auth,
    Api,
    Trading,
    Notifications,
    Payments,
    Admin,
    Global,
}

impl EndpointType {
    pub const ALL: [EndpointType; 7] = [
        EndpointType::Auth,
        EndpointType::Api,
        EndpointType::Trading,
        EndpointType::Notifications,
        EndpointType::Payments,
        EndpointType::Admin,
        EndpointType::Global,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EndpointType::Auth => "auth",
            EndpointType::Api => "api",
            EndpointType::Trading => "trading",
            EndpointType::Notifications => "notifications",
            EndpointType::Payments => "payments",
            EndpointType::Admin => "admin",
            EndpointType::Global => "global",
        }
    }

    /// Classify a request path into an endpoint class
    pub fn classify_path(path: &str) -> Self {
        let path = path.trim_end_matches('/');
        let rest = path.strip_prefix("/api").unwrap_or(path);

        let segment = rest
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();

        match segment {
            "auth" | "login" | "register" => EndpointType::Auth,
            "trading" | "trades" | "orders" | "positions" | "automations" => EndpointType::Trading,
            "notifications" => EndpointType::Notifications,
            "payments" | "billing" | "subscriptions" => EndpointType::Payments,
            "admin" => EndpointType::Admin,
            _ if path.starts_with("/api") => EndpointType::Api,
            _ => EndpointType::Global,
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointType {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        EndpointType::ALL
            .into_iter()
            .find(|e| e.as_str() == wanted)
            .ok_or_else(|| ControlPlaneError::InvalidEndpointType(s.to_string()))
    }
}

/// Rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Enforce limits at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lifetime of a resolved limit in the in-process map, in seconds
    #[serde(default = "default_resolved_ttl_secs")]
    pub resolved_ttl_secs: u64,
    /// Maximum resolved limits kept in process
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,
    /// Pin the environment instead of detecting it from process signals
    #[serde(default)]
    pub environment: Option<Environment>,
    /// Records loaded into the repository at startup
    #[serde(default)]
    pub seed: Vec<RateLimitUpsert>,
}

fn default_enabled() -> bool {
    true
}

fn default_resolved_ttl_secs() -> u64 {
    60
}

fn default_local_capacity() -> u64 {
    256
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            resolved_ttl_secs: default_resolved_ttl_secs(),
            local_capacity: default_local_capacity(),
            environment: None,
            seed: Vec::new(),
        }
    }
}

/// Persisted rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub id: Uuid,
    pub environment: Environment,
    pub endpoint_type: EndpointType,
    pub max_requests: u32,
    pub window_ms: u64,
    pub message: String,
    pub skip_successful_requests: bool,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload, keyed by (environment, endpoint type)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitUpsert {
    pub environment: Environment,
    pub endpoint_type: EndpointType,
    pub max_requests: u32,
    pub window_ms: u64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default = "default_enabled")]
    pub is_active: bool,
    /// Who made the change
    #[serde(default)]
    pub actor: Option<String>,
}

impl RateLimitUpsert {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "max_requests must be > 0 for {}/{}",
                self.environment, self.endpoint_type
            )));
        }
        if self.window_ms == 0 {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "window_ms must be > 0 for {}/{}",
                self.environment, self.endpoint_type
            )));
        }
        Ok(())
    }
}

/// Where a resolved limit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Persisted record for the exact environment
    Exact,
    /// Persisted record for the global environment
    Global,
    /// Compiled-in table for the environment
    Static,
    /// Resolution failed; development table used
    Fallback,
}

impl ResolutionSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            ResolutionSource::Exact => "exact",
            ResolutionSource::Global => "global",
            ResolutionSource::Static => "static",
            ResolutionSource::Fallback => "fallback",
        }
    }
}

/// Effective limit for an (environment, endpoint type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRateLimit {
    pub window_ms: u64,
    pub max: u32,
    pub message: String,
    pub skip_successful_requests: bool,
    pub source: ResolutionSource,
}

impl ResolvedRateLimit {
    pub fn from_record(record: &RateLimitRecord, source: ResolutionSource) -> Self {
        Self {
            window_ms: record.window_ms,
            max: record.max_requests,
            message: record.message.clone(),
            skip_successful_requests: record.skip_successful_requests,
            source,
        }
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limit result
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Remaining requests in the current window
    pub remaining: u64,
    /// Total limit
    pub limit: u32,
    /// When the window resets (seconds from now)
    pub reset_after: u64,
    /// Retry after duration (for 429 responses)
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(remaining: u64, limit: u32, reset_after: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_after,
            retry_after: None,
        }
    }

    /// Create a denied result
    pub fn denied(limit: u32, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_after: retry_after,
            retry_after: Some(retry_after),
        }
    }
}

/// Counter key: one fixed window per (client identity, endpoint type)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub identity: String,
    pub endpoint_type: EndpointType,
}

impl RateLimitKey {
    pub fn new(identity: impl Into<String>, endpoint_type: EndpointType) -> Self {
        Self {
            identity: identity.into(),
            endpoint_type,
        }
    }

    /// Key of the counter in the shared store
    pub fn to_store_key(&self, namespace: &str) -> String {
        format!(
            "{}ratelimit:counter:{}:{}",
            namespace, self.endpoint_type, self.identity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_environment() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!("test".parse::<Environment>().unwrap(), Environment::Development);
        assert!(matches!(
            "qa".parse::<Environment>(),
            Err(ControlPlaneError::InvalidEnvironment(_))
        ));
    }

    #[test]
    fn test_parse_endpoint_type() {
        assert_eq!("trading".parse::<EndpointType>().unwrap(), EndpointType::Trading);
        assert!(matches!(
            "websocket".parse::<EndpointType>(),
            Err(ControlPlaneError::InvalidEndpointType(_))
        ));
    }

    #[test]
    fn test_classify_path() {
        assert_eq!(EndpointType::classify_path("/api/auth/login"), EndpointType::Auth);
        assert_eq!(EndpointType::classify_path("/api/orders/42"), EndpointType::Trading);
        assert_eq!(EndpointType::classify_path("/api/payments"), EndpointType::Payments);
        assert_eq!(EndpointType::classify_path("/admin/workers"), EndpointType::Admin);
        assert_eq!(EndpointType::classify_path("/api/users/me"), EndpointType::Api);
        assert_eq!(EndpointType::classify_path("/health"), EndpointType::Global);
    }

    #[test]
    fn test_rate_limit_key_to_store_key() {
        let key = RateLimitKey::new("192.168.1.1", EndpointType::Auth);
        assert_eq!(
            key.to_store_key("trading:"),
            "trading:ratelimit:counter:auth:192.168.1.1"
        );
    }

    #[test]
    fn test_upsert_validation() {
        let mut upsert = RateLimitUpsert {
            environment: Environment::Staging,
            endpoint_type: EndpointType::Trading,
            max_requests: 10,
            window_ms: 60_000,
            message: None,
            skip_successful_requests: false,
            is_active: true,
            actor: None,
        };
        assert!(upsert.validate().is_ok());

        upsert.window_ms = 0;
        assert!(upsert.validate().is_err());
    }

    #[test]
    fn test_rate_limit_result() {
        let allowed = RateLimitResult::allowed(50, 100, 30);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 50);

        let denied = RateLimitResult::denied(100, 30);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(30));
    }
}
