use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;

use crate::db::{DbClient, EffectivePermissions};

type CacheKey = (String, String);

struct CachedAccess {
    access: Arc<EffectivePermissions>,
    loaded_at: Instant,
    last_used: AtomicU64,
}

/// Effective permissions per `(user, organization)`, bounded by a TTL and
/// a capacity with least-recently-used eviction.
pub struct PermissionCache {
    entries: DashMap<CacheKey, CachedAccess>,
    ttl: Duration,
    capacity: usize,
    clock: AtomicU64,
}

impl PermissionCache {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn get(&self, user_id: &str, organization_id: &str) -> Option<Arc<EffectivePermissions>> {
        let key = (user_id.to_string(), organization_id.to_string());
        let fresh = {
            let entry = self.entries.get(&key)?;
            if entry.loaded_at.elapsed() < self.ttl {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                Some(Arc::clone(&entry.access))
            } else {
                None
            }
        };

        if fresh.is_none() {
            self.entries
                .remove_if(&key, |_, entry| entry.loaded_at.elapsed() >= self.ttl);
        }
        fresh
    }

    pub fn insert(&self, user_id: &str, organization_id: &str, access: Arc<EffectivePermissions>) {
        let key = (user_id.to_string(), organization_id.to_string());
        self.entries.insert(
            key.clone(),
            CachedAccess {
                access,
                loaded_at: Instant::now(),
                last_used: AtomicU64::new(self.tick()),
            },
        );

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.least_recently_used(&key) else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn least_recently_used(&self, keep: &CacheKey) -> Option<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| entry.value().last_used.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone())
    }

    /// Cached permissions, loading them from the store on a miss.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub async fn load(
        &self,
        db: &DbClient,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Arc<EffectivePermissions>> {
        if let Some(access) = self.get(user_id, organization_id) {
            return Ok(access);
        }

        let access = Arc::new(db.effective_permissions(user_id, organization_id).await?);
        self.insert(user_id, organization_id, Arc::clone(&access));
        Ok(access)
    }

    /// Drops every cached entry for the organization; called after role,
    /// membership or permission changes.
    pub fn invalidate_organization(&self, organization_id: &str) {
        self.entries
            .retain(|(_, cached_organization), _| cached_organization != organization_id);
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.entries.retain(|(cached_user, _), _| cached_user != user_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UserType;
    use crate::testing::{audit, seed_user, temp_db};

    fn access(role: &str) -> Arc<EffectivePermissions> {
        let mut permissions = EffectivePermissions::default();
        permissions.roles.insert(role.to_string());
        Arc::new(permissions)
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let cache = PermissionCache::new(Duration::ZERO, 10);
        cache.insert("user", "org", access("admin"));

        assert!(cache.get("user", "org").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn the_least_recently_used_entry_is_evicted_at_capacity() {
        let cache = PermissionCache::new(Duration::from_secs(60), 2);
        cache.insert("alice", "org", access("admin"));
        cache.insert("bob", "org", access("viewer"));
        assert!(cache.get("alice", "org").is_some());

        cache.insert("carol", "org", access("member"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("alice", "org").is_some());
        assert!(cache.get("bob", "org").is_none());
        assert!(cache.get("carol", "org").is_some());
    }

    #[test]
    fn invalidation_is_scoped_to_one_organization() {
        let cache = PermissionCache::new(Duration::from_secs(60), 10);
        cache.insert("alice", "org-a", access("admin"));
        cache.insert("alice", "org-b", access("admin"));
        cache.insert("bob", "org-a", access("viewer"));

        cache.invalidate_organization("org-a");

        assert_eq!(cache.len(), 1);
        assert!(cache.get("alice", "org-b").is_some());
    }

    #[tokio::test]
    async fn loads_are_served_from_cache_until_invalidated() {
        let db = temp_db().await;
        let owner = seed_user(&db, "owner", UserType::Admin).await;
        let organization = db
            .create_organization("Acme", "acme", "", &owner)
            .await
            .expect("organization");
        let cache = PermissionCache::new(Duration::from_secs(60), 10);

        let first = cache.load(&db, &owner, &organization.id).await.expect("load");
        assert!(first.roles.contains("admin"));

        let audit = audit(&owner, &organization.id, "organization", "update");
        db.remove_member(&organization.id, &owner, &audit)
            .await
            .expect("remove member");

        let cached = cache.load(&db, &owner, &organization.id).await.expect("cached");
        assert!(cached.roles.contains("admin"));

        cache.invalidate_organization(&organization.id);
        let reloaded = cache.load(&db, &owner, &organization.id).await.expect("reload");
        assert!(reloaded.roles.is_empty());
    }
}
