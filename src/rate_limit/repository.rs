//! Persisted rate limit configuration
//!
//! [`RateLimitRepository`] is the seam to the relational store. Records are
//! keyed by `(environment, endpoint_type)`; upserting an existing pair
//! updates it in place and keeps its id.

use super::types::{EndpointType, Environment, RateLimitRecord, RateLimitUpsert};
use crate::error::{ControlPlaneError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Active record for an exact `(environment, endpoint_type)` pair
    async fn find_active(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
    ) -> Result<Option<RateLimitRecord>>;

    /// All records, optionally filtered by environment
    async fn list(&self, environment: Option<Environment>) -> Result<Vec<RateLimitRecord>>;

    /// Insert or update the record for the payload's key
    async fn upsert(&self, upsert: RateLimitUpsert) -> Result<RateLimitRecord>;

    /// Enable or disable a record. Returns None if it does not exist.
    async fn set_active(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
        active: bool,
        actor: Option<String>,
    ) -> Result<Option<RateLimitRecord>>;

    /// Delete a record. Returns false if it did not exist.
    async fn delete(&self, environment: Environment, endpoint_type: EndpointType) -> Result<bool>;
}

/// In-process repository
///
/// Backs development deployments and tests. It can be switched unavailable
/// to exercise the resolver's fallback path.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitRepository {
    records: RwLock<HashMap<(Environment, EndpointType), RateLimitRecord>>,
    unavailable: AtomicBool,
    queries: AtomicU64,
}

impl InMemoryRateLimitRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository from configuration
    pub async fn with_records(upserts: Vec<RateLimitUpsert>) -> Result<Self> {
        let repository = Self::new();
        for upsert in upserts {
            repository.upsert(upsert).await?;
        }
        Ok(repository)
    }

    /// Simulate the database going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Number of lookups served, for cache effectiveness checks
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ControlPlaneError::Repository(
                "rate limit repository unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitRepository for InMemoryRateLimitRepository {
    async fn find_active(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
    ) -> Result<Option<RateLimitRecord>> {
        self.check_available()?;
        self.queries.fetch_add(1, Ordering::Relaxed);

        let records = self.records.read().await;
        Ok(records
            .get(&(environment, endpoint_type))
            .filter(|r| r.is_active)
            .cloned())
    }

    async fn list(&self, environment: Option<Environment>) -> Result<Vec<RateLimitRecord>> {
        self.check_available()?;

        let records = self.records.read().await;
        let mut list: Vec<RateLimitRecord> = records
            .values()
            .filter(|r| environment.map_or(true, |env| r.environment == env))
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            (a.environment.as_str(), a.endpoint_type.as_str())
                .cmp(&(b.environment.as_str(), b.endpoint_type.as_str()))
        });
        Ok(list)
    }

    async fn upsert(&self, upsert: RateLimitUpsert) -> Result<RateLimitRecord> {
        self.check_available()?;
        upsert.validate()?;

        let now = Utc::now();
        let key = (upsert.environment, upsert.endpoint_type);
        let message = upsert
            .message
            .unwrap_or_else(|| "Too many requests, please try again later.".to_string());

        let mut records = self.records.write().await;
        let record = match records.get_mut(&key) {
            Some(existing) => {
                existing.max_requests = upsert.max_requests;
                existing.window_ms = upsert.window_ms;
                existing.message = message;
                existing.skip_successful_requests = upsert.skip_successful_requests;
                existing.is_active = upsert.is_active;
                existing.updated_by = upsert.actor;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = RateLimitRecord {
                    id: Uuid::new_v4(),
                    environment: upsert.environment,
                    endpoint_type: upsert.endpoint_type,
                    max_requests: upsert.max_requests,
                    window_ms: upsert.window_ms,
                    message,
                    skip_successful_requests: upsert.skip_successful_requests,
                    is_active: upsert.is_active,
                    created_by: upsert.actor.clone(),
                    updated_by: upsert.actor,
                    created_at: now,
                    updated_at: now,
                };
                records.insert(key, record.clone());
                record
            }
        };

        info!(
            environment = %record.environment,
            endpoint_type = %record.endpoint_type,
            max_requests = record.max_requests,
            window_ms = record.window_ms,
            "Upserted rate limit config"
        );
        Ok(record)
    }

    async fn set_active(
        &self,
        environment: Environment,
        endpoint_type: EndpointType,
        active: bool,
        actor: Option<String>,
    ) -> Result<Option<RateLimitRecord>> {
        self.check_available()?;

        let mut records = self.records.write().await;
        Ok(records.get_mut(&(environment, endpoint_type)).map(|record| {
            record.is_active = active;
            record.updated_by = actor;
            record.updated_at = Utc::now();
            debug!(%environment, %endpoint_type, active, "Toggled rate limit config");
            record.clone()
        }))
    }

    async fn delete(&self, environment: Environment, endpoint_type: EndpointType) -> Result<bool> {
        self.check_available()?;

        let removed = self
            .records
            .write()
            .await
            .remove(&(environment, endpoint_type))
            .is_some();
        if removed {
            info!(%environment, %endpoint_type, "Deleted rate limit config");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(env: Environment, endpoint: EndpointType, max: u32) -> RateLimitUpsert {
        RateLimitUpsert {
            environment: env,
            endpoint_type: endpoint,
            max_requests: max,
            window_ms: 60_000,
            message: None,
            skip_successful_requests: false,
            is_active: true,
            actor: Some("admin".to_string()),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity() {
        let repo = InMemoryRateLimitRepository::new();
        let first = repo
            .upsert(upsert(Environment::Staging, EndpointType::Trading, 10))
            .await
            .unwrap();
        let second = repo
            .upsert(upsert(Environment::Staging, EndpointType::Trading, 20))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.max_requests, 20);
        assert_eq!(repo.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_records_are_not_found() {
        let repo = InMemoryRateLimitRepository::new();
        repo.upsert(upsert(Environment::Production, EndpointType::Auth, 5))
            .await
            .unwrap();

        let toggled = repo
            .set_active(Environment::Production, EndpointType::Auth, false, None)
            .await
            .unwrap();
        assert!(toggled.is_some_and(|r| !r.is_active));

        let found = repo
            .find_active(Environment::Production, EndpointType::Auth)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_environment() {
        let repo = InMemoryRateLimitRepository::with_records(vec![
            upsert(Environment::Staging, EndpointType::Api, 10),
            upsert(Environment::Production, EndpointType::Api, 5),
            upsert(Environment::Global, EndpointType::Api, 50),
        ])
        .await
        .unwrap();

        let staging = repo.list(Some(Environment::Staging)).await.unwrap();
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].max_requests, 10);
        assert_eq!(repo.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_repository_errors() {
        let repo = InMemoryRateLimitRepository::new();
        repo.set_available(false);

        let result = repo
            .find_active(Environment::Staging, EndpointType::Api)
            .await;
        assert!(matches!(result, Err(ControlPlaneError::Repository(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = InMemoryRateLimitRepository::new();
        repo.upsert(upsert(Environment::Staging, EndpointType::Api, 10))
            .await
            .unwrap();

        assert!(repo.delete(Environment::Staging, EndpointType::Api).await.unwrap());
        assert!(!repo.delete(Environment::Staging, EndpointType::Api).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_upsert_rejected() {
        let repo = InMemoryRateLimitRepository::new();
        let result = repo
            .upsert(upsert(Environment::Staging, EndpointType::Api, 0))
            .await;
        assert!(matches!(result, Err(ControlPlaneError::InvalidRequest(_))));
    }
}
