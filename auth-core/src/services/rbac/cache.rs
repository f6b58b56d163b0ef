//! Shared cache for resolved permissions.
//!
//! Entries carry their role version stamps; the resolver checks every hit
//! against current versions before trusting it, so a cache only ever saves the
//! expansion work, never hides a role change.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::sync::Arc;
use uuid::Uuid;

use super::EffectivePermissions;
use crate::utils::Clock;

#[async_trait]
pub trait PermissionCache: Send + Sync {
    async fn get(&self, principal_id: Uuid) -> Result<Option<EffectivePermissions>, anyhow::Error>;

    async fn put(
        &self,
        principal_id: Uuid,
        permissions: &EffectivePermissions,
    ) -> Result<(), anyhow::Error>;

    async fn invalidate(&self, principal_id: Uuid) -> Result<(), anyhow::Error>;
}

/// In-process cache for single-node deployments and tests.
pub struct LocalPermissionCache {
    entries: DashMap<Uuid, (EffectivePermissions, DateTime<Utc>)>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LocalPermissionCache {
    pub fn new(ttl_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::seconds(ttl_seconds as i64),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PermissionCache for LocalPermissionCache {
    async fn get(&self, principal_id: Uuid) -> Result<Option<EffectivePermissions>, anyhow::Error> {
        let now = self.clock.now();
        let hit = self
            .entries
            .get(&principal_id)
            .map(|entry| (entry.0.clone(), entry.1));

        match hit {
            Some((permissions, expires_at)) if expires_at > now => Ok(Some(permissions)),
            Some(_) => {
                self.entries.remove(&principal_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        principal_id: Uuid,
        permissions: &EffectivePermissions,
    ) -> Result<(), anyhow::Error> {
        let expires_at = self.clock.now() + self.ttl;
        self.entries
            .insert(principal_id, (permissions.clone(), expires_at));
        Ok(())
    }

    async fn invalidate(&self, principal_id: Uuid) -> Result<(), anyhow::Error> {
        self.entries.remove(&principal_id);
        Ok(())
    }
}

/// Redis-backed cache shared by every instance.
#[derive(Clone)]
pub struct RedisPermissionCache {
    manager: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisPermissionCache {
    pub async fn new(url: &str, ttl_seconds: u64) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis permission cache");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            manager,
            ttl_seconds,
        })
    }

    fn key(principal_id: Uuid) -> String {
        format!("authz:permissions:{}", principal_id)
    }
}

#[async_trait]
impl PermissionCache for RedisPermissionCache {
    async fn get(&self, principal_id: Uuid) -> Result<Option<EffectivePermissions>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(principal_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read permission cache: {}", e))?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        principal_id: Uuid,
        permissions: &EffectivePermissions,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(permissions)?;

        redis::cmd("SET")
            .arg(Self::key(principal_id))
            .arg(json)
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write permission cache: {}", e))
    }

    async fn invalidate(&self, principal_id: Uuid) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(Self::key(principal_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to invalidate permission cache: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    #[tokio::test]
    async fn test_local_cache_expires_after_ttl() {
        let clock = ManualClock::new(Utc::now());
        let cache = LocalPermissionCache::new(60, Arc::new(clock.clone()));
        let principal = Uuid::new_v4();

        cache
            .put(principal, &EffectivePermissions::default())
            .await
            .unwrap();
        assert!(cache.get(principal).await.unwrap().is_some());

        clock.advance(Duration::seconds(61));
        assert!(cache.get(principal).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_local_cache_invalidate() {
        let clock = ManualClock::new(Utc::now());
        let cache = LocalPermissionCache::new(60, Arc::new(clock));
        let principal = Uuid::new_v4();

        cache
            .put(principal, &EffectivePermissions::default())
            .await
            .unwrap();
        cache.invalidate(principal).await.unwrap();
        assert!(cache.get(principal).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn test_redis_cache_roundtrip() {
        let cache = RedisPermissionCache::new("redis://127.0.0.1:6379", 30)
            .await
            .unwrap();
        let principal = Uuid::new_v4();
        let mut permissions = EffectivePermissions::default();
        permissions.permissions.insert("user:read:own".parse().unwrap());

        cache.put(principal, &permissions).await.unwrap();
        assert_eq!(cache.get(principal).await.unwrap(), Some(permissions));
        cache.invalidate(principal).await.unwrap();
    }
}
