use crate::balancer::BalancerConfig;
use crate::cache::CacheConfig;
use crate::error::{ControlPlaneError, Result};
use crate::healthcheck::HealthCheckConfig;
use crate::rate_limit::RateLimitSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables overriding file values,
/// e.g. `CONTROL_PLANE__SERVER__PORT=9090`
pub const ENV_PREFIX: &str = "CONTROL_PLANE";

/// Main control plane configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Admin server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared key-value store
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache engine configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rate limit resolution and enforcement
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Worker pool balancer
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// Active worker health checks
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_filter() -> String {
    "control_plane=debug,tower_http=debug".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from a file, with `CONTROL_PLANE__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ControlPlaneError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ControlPlaneError::Config(format!("Failed to load config: {}", e)))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ControlPlaneError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.redis.url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ControlPlaneError::Config(format!(
                    "Redis URL must start with redis:// or rediss://: {}",
                    url
                )));
            }
        }

        if self.cache.ttl_overrides.values().any(|secs| *secs == 0) {
            return Err(ControlPlaneError::Config(
                "Cache TTL overrides must be > 0".to_string(),
            ));
        }

        if self.rate_limit.resolved_ttl_secs == 0 {
            return Err(ControlPlaneError::Config(
                "Resolved rate limit TTL must be > 0".to_string(),
            ));
        }
        for upsert in &self.rate_limit.seed {
            upsert.validate()?;
        }

        self.validate_balancer()?;

        if self.health_check.enabled {
            if self.health_check.interval_secs == 0 {
                return Err(ControlPlaneError::Config(
                    "Health check interval must be > 0".to_string(),
                ));
            }
            if self.health_check.timeout_ms == 0 {
                return Err(ControlPlaneError::Config(
                    "Health check timeout must be > 0".to_string(),
                ));
            }
            if !self.health_check.path.starts_with('/') {
                return Err(ControlPlaneError::Config(format!(
                    "Health check path must start with '/': {}",
                    self.health_check.path
                )));
            }
        }

        Ok(())
    }

    fn validate_balancer(&self) -> Result<()> {
        let balancer = &self.balancer;

        if balancer.min_nodes > balancer.max_nodes {
            return Err(ControlPlaneError::Config(format!(
                "min_nodes ({}) must not exceed max_nodes ({})",
                balancer.min_nodes, balancer.max_nodes
            )));
        }
        if balancer.timeout_ms == 0 {
            return Err(ControlPlaneError::Config(
                "Balancer timeout must be > 0".to_string(),
            ));
        }
        if balancer.failure_threshold == 0 {
            return Err(ControlPlaneError::Config(
                "Failure threshold must be > 0".to_string(),
            ));
        }
        if balancer.template.max_jobs == 0 {
            return Err(ControlPlaneError::Config(
                "Worker template must accept at least one job".to_string(),
            ));
        }

        let autoscale = &balancer.autoscale;
        if !(0.0..=1.0).contains(&autoscale.scale_up_utilization)
            || !(0.0..=1.0).contains(&autoscale.scale_down_utilization)
        {
            return Err(ControlPlaneError::Config(
                "Autoscale utilization thresholds must be within 0.0..=1.0".to_string(),
            ));
        }
        if autoscale.scale_down_utilization >= autoscale.scale_up_utilization {
            return Err(ControlPlaneError::Config(
                "scale_down_utilization must be below scale_up_utilization".to_string(),
            ));
        }

        for spec in &balancer.workers {
            crate::balancer::validate_spec(spec)?;
        }

        Ok(())
    }
}
