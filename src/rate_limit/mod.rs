//! Rate limiting module
//!
//! Resolves an effective limit for an (environment, endpoint class) pair and
//! enforces it with fixed-window counters in the shared store.
//!
//! # Features
//!
//! - Environment detection from process signals, explicit before heuristic
//! - Layered resolution: in-process map, shared cache, repository, static table
//! - Fixed-window counters per (client identity, endpoint class), counted in
//!   process while the store is unreachable
//! - `skip_successful_requests` limits that only count failed attempts
//! - Rate limit headers in responses (`X-RateLimit-*`)
//!
//! # Example
//!
//! ```rust,no_run
//! use control_plane::cache::{CacheConfig, CacheEngine};
//! use control_plane::rate_limit::{
//!     EndpointType, Environment, FixedWindowLimiter, InMemoryRateLimitRepository,
//!     RateLimitResolver, RateLimitSettings, RateLimiterService,
//! };
//! use control_plane::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     let cache = Arc::new(CacheEngine::new(store.clone(), CacheConfig::default()));
//!     let resolver = Arc::new(RateLimitResolver::new(
//!         Environment::Production,
//!         cache,
//!         Arc::new(InMemoryRateLimitRepository::new()),
//!         &RateLimitSettings::default(),
//!     ));
//!
//!     let service = RateLimiterService::new(resolver, FixedWindowLimiter::new(store, "trading:"), true);
//!     let decision = service.check("203.0.113.7", EndpointType::Auth).await;
//!     println!("allowed: {}", decision.result.allowed);
//! }
//! ```

pub mod defaults;
pub mod environment;
pub mod limiter;
pub mod middleware;
pub mod repository;
pub mod resolver;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use defaults::{fallback_limit, static_limit};
pub use environment::{detect_environment, EnvSnapshot};
pub use limiter::FixedWindowLimiter;
pub use middleware::{add_rate_limit_headers, client_identity, rate_limit_middleware};
pub use repository::{InMemoryRateLimitRepository, RateLimitRepository};
pub use resolver::RateLimitResolver;
pub use service::{RateLimitDecision, RateLimiterService};
pub use types::{
    EndpointType, Environment, RateLimitKey, RateLimitRecord, RateLimitResult, RateLimitSettings,
    RateLimitUpsert, ResolutionSource, ResolvedRateLimit,
};
