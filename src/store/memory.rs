//! In-memory repositories for development and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BrokerConnectionRepository, ChannelRepository, PolicyRepository, ReviewSink, SessionStore,
    TenantRepository,
};
use crate::domain::{BrokerConnection, ChannelConfig, NormalizedSignal, Tenant, TradingPolicy};
use crate::error::{RelayError, Result};

/// Every entity repository over concurrent maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: DashMap<String, Tenant>,
    channels: DashMap<Uuid, ChannelConfig>,
    policies: DashMap<String, TradingPolicy>,
    brokers: DashMap<Uuid, BrokerConnection>,
    reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lookups served, used to observe cache behaviour
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }
}

fn duplicate(entity: &str, id: impl std::fmt::Display) -> RelayError {
    RelayError::Validation(format!("{} {} already exists", entity, id))
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.count_read();
        Ok(self.tenants.get(tenant_id).map(|t| t.clone()))
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        self.count_read();
        let mut active: Vec<Tenant> = self
            .tenants
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn add(&self, tenant: &Tenant) -> Result<()> {
        match self.tenants.entry(tenant.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(duplicate("tenant", &tenant.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tenant.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, tenant: &Tenant) -> Result<()> {
        let mut existing = self
            .tenants
            .get_mut(&tenant.id)
            .ok_or_else(|| RelayError::not_found("tenant", &tenant.id))?;
        *existing = tenant.clone();
        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.tenants.remove(tenant_id).is_some())
    }

    async fn exists(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.tenants.contains_key(tenant_id))
    }
}

#[async_trait]
impl ChannelRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<ChannelConfig>> {
        self.count_read();
        Ok(self.channels.get(&id).map(|c| c.clone()))
    }

    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Vec<ChannelConfig>> {
        self.count_read();
        Ok(self
            .channels
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| c.clone())
            .collect())
    }

    async fn find(&self, tenant_id: &str, channel_id: &str) -> Result<Option<ChannelConfig>> {
        self.count_read();
        Ok(self
            .channels
            .iter()
            .find(|c| c.tenant_id == tenant_id && c.channel_id == channel_id)
            .map(|c| c.clone()))
    }

    async fn add(&self, config: &ChannelConfig) -> Result<()> {
        let clash = self.channels.iter().any(|c| {
            c.id == config.id
                || (c.tenant_id == config.tenant_id && c.channel_id == config.channel_id)
        });
        if clash {
            return Err(duplicate("channel config", &config.channel_id));
        }
        self.channels.insert(config.id, config.clone());
        Ok(())
    }

    async fn update(&self, config: &ChannelConfig) -> Result<()> {
        let mut existing = self
            .channels
            .get_mut(&config.id)
            .ok_or_else(|| RelayError::not_found("channel config", config.id))?;
        *existing = config.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.channels.remove(&id).is_some())
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.channels.contains_key(&id))
    }
}

#[async_trait]
impl PolicyRepository for MemoryStore {
    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Option<TradingPolicy>> {
        self.count_read();
        Ok(self.policies.get(tenant_id).map(|p| p.clone()))
    }

    async fn add(&self, policy: &TradingPolicy) -> Result<()> {
        if self.policies.contains_key(&policy.tenant_id) {
            return Err(duplicate("trading policy for tenant", &policy.tenant_id));
        }
        self.policies.insert(policy.tenant_id.clone(), policy.clone());
        Ok(())
    }

    async fn update(&self, policy: &TradingPolicy) -> Result<()> {
        let mut existing = self
            .policies
            .get_mut(&policy.tenant_id)
            .ok_or_else(|| RelayError::not_found("trading policy", &policy.tenant_id))?;
        *existing = policy.clone();
        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.policies.remove(tenant_id).is_some())
    }

    async fn exists(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.policies.contains_key(tenant_id))
    }
}

#[async_trait]
impl BrokerConnectionRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<BrokerConnection>> {
        self.count_read();
        Ok(self.brokers.get(&id).map(|b| b.clone()))
    }

    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Vec<BrokerConnection>> {
        self.count_read();
        let mut connections: Vec<BrokerConnection> = self
            .brokers
            .iter()
            .filter(|b| b.tenant_id == tenant_id)
            .map(|b| b.clone())
            .collect();
        connections.sort_by_key(|b| b.created_at);
        Ok(connections)
    }

    async fn add(&self, connection: &BrokerConnection) -> Result<()> {
        if self.brokers.contains_key(&connection.id) {
            return Err(duplicate("broker connection", connection.id));
        }
        self.brokers.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn update(&self, connection: &BrokerConnection) -> Result<()> {
        let mut existing = self
            .brokers
            .get_mut(&connection.id)
            .ok_or_else(|| RelayError::not_found("broker connection", connection.id))?;
        *existing = connection.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.brokers.remove(&id).is_some())
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.brokers.contains_key(&id))
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut existing = self
            .brokers
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found("broker connection", id))?;
        existing.mark_used(at);
        Ok(())
    }
}

/// Session blobs keyed by (tenant, file name)
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    files: DashMap<(String, String), Vec<u8>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, tenant_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .get(&(tenant_id.to_string(), name.to_string()))
            .map(|f| f.clone()))
    }

    async fn put(&self, tenant_id: &str, name: &str, data: &[u8]) -> Result<()> {
        self.files
            .insert((tenant_id.to_string(), name.to_string()), data.to_vec());
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, name: &str) -> Result<()> {
        self.files.remove(&(tenant_id.to_string(), name.to_string()));
        Ok(())
    }
}

/// A signal parked for manual review
#[derive(Debug, Clone)]
pub struct ReviewRecord {
    pub signal: NormalizedSignal,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryReviewSink {
    records: RwLock<Vec<ReviewRecord>>,
}

impl MemoryReviewSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ReviewRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl ReviewSink for MemoryReviewSink {
    async fn record(&self, signal: &NormalizedSignal, reason: &str) -> Result<()> {
        self.records.write().await.push(ReviewRecord {
            signal: signal.clone(),
            reason: reason.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
