//! Persistence boundary
//!
//! The core only talks to these traits. `memory` backs development and
//! tests; `postgres` is the production backend.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{BrokerConnection, ChannelConfig, NormalizedSignal, Tenant, TradingPolicy};
use crate::error::Result;

pub use memory::{MemoryReviewSink, MemorySessionStore, MemoryStore};
pub use postgres::PostgresStore;

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>>;
    async fn list_active(&self) -> Result<Vec<Tenant>>;
    async fn add(&self, tenant: &Tenant) -> Result<()>;
    async fn update(&self, tenant: &Tenant) -> Result<()>;
    async fn delete(&self, tenant_id: &str) -> Result<bool>;
    async fn exists(&self, tenant_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ChannelConfig>>;
    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Vec<ChannelConfig>>;
    /// Look up by the external channel id within a tenant
    async fn find(&self, tenant_id: &str, channel_id: &str) -> Result<Option<ChannelConfig>>;
    async fn add(&self, config: &ChannelConfig) -> Result<()>;
    async fn update(&self, config: &ChannelConfig) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn exists(&self, id: Uuid) -> Result<bool>;
}

/// Trading policies are one per tenant and keyed by tenant id
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Option<TradingPolicy>>;
    async fn add(&self, policy: &TradingPolicy) -> Result<()>;
    async fn update(&self, policy: &TradingPolicy) -> Result<()>;
    async fn delete(&self, tenant_id: &str) -> Result<bool>;
    async fn exists(&self, tenant_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait BrokerConnectionRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<BrokerConnection>>;
    async fn get_by_tenant(&self, tenant_id: &str) -> Result<Vec<BrokerConnection>>;
    async fn add(&self, connection: &BrokerConnection) -> Result<()>;
    async fn update(&self, connection: &BrokerConnection) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn exists(&self, id: Uuid) -> Result<bool>;
    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// Opaque per-tenant files (feed session resumption blobs)
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, tenant_id: &str, name: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, tenant_id: &str, name: &str, data: &[u8]) -> Result<()>;
    async fn delete(&self, tenant_id: &str, name: &str) -> Result<()>;
}

/// Destination for signals held back because auto-execute is off
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn record(&self, signal: &NormalizedSignal, reason: &str) -> Result<()>;
}

/// All repositories the relay needs, bundled for wiring
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<dyn TenantRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub policies: Arc<dyn PolicyRepository>,
    pub brokers: Arc<dyn BrokerConnectionRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub reviews: Arc<dyn ReviewSink>,
}

impl Repositories {
    /// In-memory backend; returns the concrete stores too so callers can seed them
    pub fn in_memory() -> (Self, Arc<MemoryStore>, Arc<MemoryReviewSink>) {
        let store = Arc::new(MemoryStore::new());
        let reviews = Arc::new(MemoryReviewSink::new());
        let repos = Self {
            tenants: store.clone(),
            channels: store.clone(),
            policies: store.clone(),
            brokers: store.clone(),
            sessions: Arc::new(MemorySessionStore::new()),
            reviews: reviews.clone(),
        };
        (repos, store, reviews)
    }

    pub fn postgres(store: PostgresStore) -> Self {
        let store = Arc::new(store);
        Self {
            tenants: store.clone(),
            channels: store.clone(),
            policies: store.clone(),
            brokers: store.clone(),
            sessions: store.clone(),
            reviews: store,
        }
    }
}
