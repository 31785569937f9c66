//! Read-through caching decorator for [`RealmStore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ApiApp, Realm, RealmId, RealmStore, Session, StoreError, User, UserId};
use crate::cache::{Cache, CacheStatsSnapshot};

/// Caches app and realm lookups; users and sessions always hit the store so
/// that revocations take effect immediately.
pub struct CachedRealmStore {
    inner: Arc<dyn RealmStore>,
    apps: Cache<ApiApp>,
    realms: Cache<Realm>,
    ttl: Duration,
}

impl CachedRealmStore {
    /// Wrap `inner`, hashing cache keys with `hmac_key`.
    #[must_use]
    pub fn new(inner: Arc<dyn RealmStore>, hmac_key: &[u8], ttl: Duration) -> Self {
        Self {
            inner,
            apps: Cache::new(hmac_key),
            realms: Cache::new(hmac_key),
            ttl,
        }
    }

    /// Drop expired entries from both caches. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        self.apps.evict_expired() + self.realms.evict_expired()
    }

    /// Statistics of the API-app cache.
    #[must_use]
    pub fn app_stats(&self) -> CacheStatsSnapshot {
        self.apps.stats()
    }
}

#[async_trait]
impl RealmStore for CachedRealmStore {
    async fn find_realm(&self, id: RealmId) -> Result<Option<Realm>, StoreError> {
        let key = self.realms.build_key("realm", &id.to_string());
        self.realms
            .fetch(&key, self.ttl, || self.inner.find_realm(id))
            .await
    }

    async fn find_app_by_digest(&self, digest: &str) -> Result<Option<ApiApp>, StoreError> {
        let key = self.apps.build_key("apikey", digest);
        self.apps
            .fetch(&key, self.ttl, || self.inner.find_app_by_digest(digest))
            .await
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.inner.find_user(id).await
    }

    async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.inner.find_session(id).await
    }
}
