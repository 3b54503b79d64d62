//! Tenant configuration cache
//!
//! Read-through TTL caches in front of the repositories the pipeline hits
//! for every message. Misses and expired entries fall through to the
//! backing store; only found entities are cached.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::coordination::SharedClock;
use crate::domain::{BrokerConnection, ChannelConfig, ConfigChange, Tenant, TradingPolicy};
use crate::error::Result;
use crate::store::{
    BrokerConnectionRepository, ChannelRepository, PolicyRepository, TenantRepository,
};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct TtlMap<K, V> {
    entries: DashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn get(&self, key: &K, now: Instant) -> Option<V> {
        let hit = self.entries.get(key).and_then(|e| {
            if e.expires_at > now {
                Some(e.value.clone())
            } else {
                None
            }
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        hit
    }

    fn put(&self, key: K, value: V, expires_at: Instant) {
        self.entries.insert(key, Entry { value, expires_at });
    }

    fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    fn retain(&self, keep: impl FnMut(&K, &mut Entry<V>) -> bool) {
        self.entries.retain(keep);
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cache TTLs per entity kind
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub tenant_ttl: Duration,
    pub channel_ttl: Duration,
    pub policy_ttl: Duration,
    pub broker_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let five_minutes = Duration::from_secs(300);
        Self {
            tenant_ttl: five_minutes,
            channel_ttl: five_minutes,
            policy_ttl: five_minutes,
            broker_ttl: five_minutes,
        }
    }
}

pub struct TenantConfigCache {
    tenants_repo: Arc<dyn TenantRepository>,
    channels_repo: Arc<dyn ChannelRepository>,
    policies_repo: Arc<dyn PolicyRepository>,
    brokers_repo: Arc<dyn BrokerConnectionRepository>,
    config: CacheConfig,
    clock: SharedClock,
    tenants: TtlMap<String, Tenant>,
    channels: TtlMap<(String, String), ChannelConfig>,
    policies: TtlMap<String, TradingPolicy>,
    active_brokers: TtlMap<String, Vec<BrokerConnection>>,
}

impl TenantConfigCache {
    pub fn new(
        tenants_repo: Arc<dyn TenantRepository>,
        channels_repo: Arc<dyn ChannelRepository>,
        policies_repo: Arc<dyn PolicyRepository>,
        brokers_repo: Arc<dyn BrokerConnectionRepository>,
        config: CacheConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            tenants_repo,
            channels_repo,
            policies_repo,
            brokers_repo,
            config,
            clock,
            tenants: TtlMap::new(),
            channels: TtlMap::new(),
            policies: TtlMap::new(),
            active_brokers: TtlMap::new(),
        }
    }

    pub async fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let key = tenant_id.to_string();
        if let Some(hit) = self.tenants.get(&key, self.clock.now()) {
            return Ok(Some(hit));
        }
        let loaded = self.tenants_repo.get(tenant_id).await?;
        if let Some(tenant) = &loaded {
            self.tenants
                .put(key, tenant.clone(), self.clock.now() + self.config.tenant_ttl);
        }
        Ok(loaded)
    }

    pub async fn channel(
        &self,
        tenant_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelConfig>> {
        let key = (tenant_id.to_string(), channel_id.to_string());
        if let Some(hit) = self.channels.get(&key, self.clock.now()) {
            return Ok(Some(hit));
        }
        let loaded = self.channels_repo.find(tenant_id, channel_id).await?;
        if let Some(config) = &loaded {
            self.channels
                .put(key, config.clone(), self.clock.now() + self.config.channel_ttl);
        }
        Ok(loaded)
    }

    pub async fn policy(&self, tenant_id: &str) -> Result<Option<TradingPolicy>> {
        let key = tenant_id.to_string();
        if let Some(hit) = self.policies.get(&key, self.clock.now()) {
            return Ok(Some(hit));
        }
        let loaded = self.policies_repo.get_by_tenant(tenant_id).await?;
        if let Some(policy) = &loaded {
            self.policies
                .put(key, policy.clone(), self.clock.now() + self.config.policy_ttl);
        }
        Ok(loaded)
    }

    /// The tenant's active broker connections
    pub async fn active_brokers(&self, tenant_id: &str) -> Result<Vec<BrokerConnection>> {
        let key = tenant_id.to_string();
        if let Some(hit) = self.active_brokers.get(&key, self.clock.now()) {
            return Ok(hit);
        }
        let active: Vec<BrokerConnection> = self
            .brokers_repo
            .get_by_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|b| b.active)
            .collect();
        self.active_brokers
            .put(key, active.clone(), self.clock.now() + self.config.broker_ttl);
        Ok(active)
    }

    pub fn invalidate_tenant(&self, tenant_id: &str) {
        self.tenants.remove(&tenant_id.to_string());
    }

    pub fn invalidate_channel(&self, tenant_id: &str, channel_id: &str) {
        self.channels
            .remove(&(tenant_id.to_string(), channel_id.to_string()));
    }

    pub fn invalidate_policy(&self, tenant_id: &str) {
        self.policies.remove(&tenant_id.to_string());
    }

    pub fn invalidate_brokers(&self, tenant_id: &str) {
        self.active_brokers.remove(&tenant_id.to_string());
    }

    /// Drop everything cached for a tenant
    pub fn invalidate_all_for(&self, tenant_id: &str) {
        self.invalidate_tenant(tenant_id);
        self.invalidate_policy(tenant_id);
        self.invalidate_brokers(tenant_id);
        self.channels.retain(|(t, _), _| t != tenant_id);
    }

    /// Apply a change notification
    pub fn apply(&self, change: &ConfigChange) {
        debug!(?change, "invalidating cached configuration");
        match change {
            ConfigChange::Tenant { tenant_id } => self.invalidate_all_for(tenant_id),
            ConfigChange::Channel {
                tenant_id,
                channel_id,
            } => self.invalidate_channel(tenant_id, channel_id),
            ConfigChange::Policy { tenant_id } => self.invalidate_policy(tenant_id),
            ConfigChange::BrokerConnection { tenant_id, .. } => self.invalidate_brokers(tenant_id),
        }
    }

    pub fn clear(&self) {
        self.tenants.clear();
        self.channels.clear();
        self.policies.clear();
        self.active_brokers.clear();
    }

    /// Entry count per map: tenants, channels, policies, broker lists
    pub fn sizes(&self) -> (usize, usize, usize, usize) {
        (
            self.tenants.len(),
            self.channels.len(),
            self.policies.len(),
            self.active_brokers.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ManualClock;
    use crate::domain::{BrokerType, SubscriptionTier};
    use crate::store::MemoryStore;

    const PATTERN: &str = r"(?i)(?P<side>buy|sell)\s+(?P<symbol>[A-Z]+)";

    fn cache(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> TenantConfigCache {
        TenantConfigCache::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            CacheConfig::default(),
            clock,
        )
    }

    #[tokio::test]
    async fn test_hit_avoids_store_until_ttl() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let tenant = Tenant::new("t1", "a@b.c", SubscriptionTier::Pro).unwrap();
        TenantRepository::add(store.as_ref(), &tenant).await.unwrap();

        let cache = cache(store.clone(), clock.clone());
        assert!(cache.tenant("t1").await.unwrap().is_some());
        let reads = store.read_count();
        assert!(cache.tenant("t1").await.unwrap().is_some());
        assert_eq!(store.read_count(), reads);

        clock.advance(Duration::from_secs(301));
        assert!(cache.tenant("t1").await.unwrap().is_some());
        assert_eq!(store.read_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(store.clone(), Arc::new(ManualClock::new()));
        assert!(cache.channel("t1", "-100").await.unwrap().is_none());

        let config = ChannelConfig::new("t1", "-100", PATTERN).unwrap();
        ChannelRepository::add(store.as_ref(), &config).await.unwrap();
        assert!(cache.channel("t1", "-100").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_change_notification_invalidates() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(store.clone(), Arc::new(ManualClock::new()));

        let mut policy = TradingPolicy::new("t1");
        PolicyRepository::add(store.as_ref(), &policy).await.unwrap();
        assert!(!cache.policy("t1").await.unwrap().unwrap().auto_execute);

        policy.set_auto_execute(true);
        PolicyRepository::update(store.as_ref(), &policy).await.unwrap();
        assert!(!cache.policy("t1").await.unwrap().unwrap().auto_execute);

        cache.apply(&ConfigChange::Policy {
            tenant_id: "t1".into(),
        });
        assert!(cache.policy("t1").await.unwrap().unwrap().auto_execute);
    }

    #[tokio::test]
    async fn test_active_brokers_filters_inactive() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(store.clone(), Arc::new(ManualClock::new()));

        let active = BrokerConnection::new("t1", BrokerType::Paper, vec![]);
        let mut inactive = BrokerConnection::new("t1", BrokerType::Paper, vec![]);
        inactive.deactivate();
        BrokerConnectionRepository::add(store.as_ref(), &active).await.unwrap();
        BrokerConnectionRepository::add(store.as_ref(), &inactive).await.unwrap();

        let resolved = cache.active_brokers("t1").await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, active.id);
    }

    #[tokio::test]
    async fn test_tenant_change_drops_channels() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(store.clone(), Arc::new(ManualClock::new()));
        let config = ChannelConfig::new("t1", "-100", PATTERN).unwrap();
        ChannelRepository::add(store.as_ref(), &config).await.unwrap();
        cache.channel("t1", "-100").await.unwrap();
        assert_eq!(cache.sizes().1, 1);

        cache.apply(&ConfigChange::Tenant {
            tenant_id: "t1".into(),
        });
        assert_eq!(cache.sizes().1, 0);
    }
}
