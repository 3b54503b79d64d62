//! Channel control
//!
//! Applies add/remove-channel requests from the bus to the tenant record
//! and the tenant's feed session, and restores sessions at startup.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::pool::FeedSessionPool;
use crate::bus::Queue;
use crate::coordination::ShutdownSignal;
use crate::credentials::{self, CredentialCipher, FeedCredentials};
use crate::domain::{AddChannelRequest, ConfigChange, RemoveChannelRequest, Tenant};
use crate::error::{RelayError, Result};
use crate::store::TenantRepository;

pub struct ChannelControl {
    tenants: Arc<dyn TenantRepository>,
    pool: Arc<FeedSessionPool>,
    cipher: Arc<dyn CredentialCipher>,
    config_changes: Queue<ConfigChange>,
}

impl ChannelControl {
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        pool: Arc<FeedSessionPool>,
        cipher: Arc<dyn CredentialCipher>,
        config_changes: Queue<ConfigChange>,
    ) -> Self {
        Self {
            tenants,
            pool,
            cipher,
            config_changes,
        }
    }

    async fn active_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        let tenant = self
            .tenants
            .get(tenant_id)
            .await?
            .ok_or_else(|| RelayError::not_found("tenant", tenant_id))?;
        if !tenant.is_active() {
            return Err(RelayError::Validation(format!(
                "tenant {} is {}",
                tenant.id, tenant.status
            )));
        }
        Ok(tenant)
    }

    fn feed_credentials(&self, tenant: &Tenant) -> Result<FeedCredentials> {
        if tenant.feed_credentials.is_empty() {
            return Err(RelayError::Credentials(format!(
                "tenant {} has no feed credentials",
                tenant.id
            )));
        }
        credentials::open(self.cipher.as_ref(), &tenant.feed_credentials)
    }

    fn notify_tenant_changed(&self, tenant_id: &str) {
        let change = ConfigChange::Tenant {
            tenant_id: tenant_id.to_string(),
        };
        if let Err(e) = self.config_changes.publish(change) {
            warn!(tenant = tenant_id, error = %e, "failed to publish tenant change");
        }
    }

    /// Subscribe a tenant to a channel and start observing it.
    ///
    /// Returns false if the session was already observing the channel.
    pub async fn handle_add(&self, request: &AddChannelRequest) -> Result<bool> {
        let mut tenant = self.active_tenant(&request.tenant_id).await?;

        if tenant.subscribe_channel(&request.channel_id)? {
            self.tenants.update(&tenant).await?;
            self.notify_tenant_changed(&tenant.id);
        }

        let creds = self.feed_credentials(&tenant)?;
        let session = self.pool.get_or_create(&tenant.id, creds).await?;
        let added = session.add_channel(&request.channel_id).await?;

        info!(
            tenant = %tenant.id,
            channel = %request.channel_id,
            channel_name = request.channel_name.as_deref().unwrap_or(""),
            added,
            "channel add handled"
        );
        Ok(added)
    }

    /// Unsubscribe a tenant from a channel. Never creates a session.
    pub async fn handle_remove(&self, request: &RemoveChannelRequest) -> Result<bool> {
        let mut tenant = self.active_tenant(&request.tenant_id).await?;

        if tenant.unsubscribe_channel(&request.channel_id)? {
            self.tenants.update(&tenant).await?;
            self.notify_tenant_changed(&tenant.id);
        }

        let removed = match self.pool.get(&tenant.id) {
            Some(session) => session.remove_channel(&request.channel_id).await?,
            None => {
                debug!(tenant = %tenant.id, "no feed session, nothing to leave");
                false
            }
        };

        info!(
            tenant = %tenant.id,
            channel = %request.channel_id,
            removed,
            "channel remove handled"
        );
        Ok(removed)
    }

    /// Recreate sessions for every active tenant with subscribed channels.
    ///
    /// A tenant that fails to restore is logged and skipped. Returns the
    /// number of sessions restored.
    pub async fn restore_all(&self) -> Result<usize> {
        let tenants = self.tenants.list_active().await?;
        let mut restored = 0;

        for tenant in tenants.iter().filter(|t| !t.channel_ids.is_empty()) {
            match self.restore_tenant(tenant).await {
                Ok(channels) => {
                    restored += 1;
                    info!(tenant = %tenant.id, channels, "feed session restored");
                }
                Err(e) => warn!(tenant = %tenant.id, error = %e, "failed to restore feed session"),
            }
        }

        info!(restored, candidates = tenants.len(), "feed session restore complete");
        Ok(restored)
    }

    async fn restore_tenant(&self, tenant: &Tenant) -> Result<usize> {
        let creds = self.feed_credentials(tenant)?;
        let session = self.pool.get_or_create(&tenant.id, creds).await?;
        let mut joined = 0;
        for channel_id in &tenant.channel_ids {
            match session.add_channel(channel_id).await {
                Ok(_) => joined += 1,
                Err(e) => warn!(
                    tenant = %tenant.id,
                    channel = %channel_id,
                    error = %e,
                    "failed to rejoin channel"
                ),
            }
        }
        Ok(joined)
    }

    /// Consume add-channel requests until shutdown
    pub async fn run_add_loop(
        &self,
        queue: Queue<AddChannelRequest>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.handle_add(&request).await {
                error!(
                    tenant = %request.tenant_id,
                    channel = %request.channel_id,
                    error = %e,
                    "add channel failed"
                );
            }
        }
        debug!("add-channel loop stopped");
    }

    /// Consume remove-channel requests until shutdown
    pub async fn run_remove_loop(
        &self,
        queue: Queue<RemoveChannelRequest>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.handle_remove(&request).await {
                error!(
                    tenant = %request.tenant_id,
                    channel = %request.channel_id,
                    error = %e,
                    "remove channel failed"
                );
            }
        }
        debug!("remove-channel loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CircuitBreakerConfig, ManualClock};
    use crate::credentials::AesGcmCipher;
    use crate::feed::loopback::LoopbackHub;
    use crate::feed::pool::PoolConfig;
    use crate::feed::session::SessionContext;
    use crate::services::Metrics;
    use crate::store::{MemorySessionStore, MemoryStore};
    use crate::domain::SubscriptionTier;
    use std::time::Duration;

    struct Fixture {
        control: ChannelControl,
        store: Arc<MemoryStore>,
        hub: LoopbackHub,
        pool: Arc<FeedSessionPool>,
        changes: Queue<ConfigChange>,
    }

    async fn fixture() -> Fixture {
        let hub = LoopbackHub::new();
        let ctx = SessionContext {
            inbound: Queue::new("inbound-messages"),
            session_store: Arc::new(MemorySessionStore::new()),
            clock: Arc::new(ManualClock::new()),
            breaker: CircuitBreakerConfig::default(),
            connect_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(200),
        };
        let pool = Arc::new(FeedSessionPool::new(
            Arc::new(hub.clone()),
            ctx,
            PoolConfig::default(),
            Arc::new(Metrics::new()),
        ));
        let cipher: Arc<dyn CredentialCipher> =
            Arc::new(AesGcmCipher::from_key(&[7u8; 32]).unwrap());
        let store = Arc::new(MemoryStore::new());

        let blob = credentials::seal(
            cipher.as_ref(),
            &FeedCredentials {
                account: "acct".into(),
                token: "tok".into(),
            },
        )
        .unwrap();
        let tenant = Tenant::new("t1", "t1@example.com", SubscriptionTier::Pro)
            .unwrap()
            .with_feed_credentials(blob);
        TenantRepository::add(store.as_ref(), &tenant).await.unwrap();

        let changes = Queue::new("config-changes");
        let control = ChannelControl::new(store.clone(), pool.clone(), cipher, changes.clone());
        Fixture {
            control,
            store,
            hub,
            pool,
            changes,
        }
    }

    fn add(tenant: &str, channel: &str) -> AddChannelRequest {
        AddChannelRequest {
            tenant_id: tenant.into(),
            channel_id: channel.into(),
            channel_name: None,
        }
    }

    #[tokio::test]
    async fn test_add_persists_subscription_and_joins() {
        let f = fixture().await;

        assert!(f.control.handle_add(&add("t1", "-100")).await.unwrap());
        assert!(!f.control.handle_add(&add("t1", "-100")).await.unwrap());

        let tenant = TenantRepository::get(f.store.as_ref(), "t1").await.unwrap().unwrap();
        assert_eq!(tenant.channel_ids, vec!["-100".to_string()]);
        assert_eq!(f.hub.transport("t1").unwrap().joined_channels(), vec!["-100".to_string()]);
        assert_eq!(f.changes.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_and_inactive_tenants() {
        let f = fixture().await;
        assert!(matches!(
            f.control.handle_add(&add("ghost", "-100")).await,
            Err(RelayError::NotFound { .. })
        ));

        let mut tenant = TenantRepository::get(f.store.as_ref(), "t1").await.unwrap().unwrap();
        tenant.suspend().unwrap();
        TenantRepository::update(f.store.as_ref(), &tenant).await.unwrap();
        assert!(f.control.handle_add(&add("t1", "-100")).await.is_err());
        assert!(f.pool.is_empty());
    }

    #[tokio::test]
    async fn test_remove_without_session_does_not_create_one() {
        let f = fixture().await;
        let request = RemoveChannelRequest {
            tenant_id: "t1".into(),
            channel_id: "-100".into(),
        };
        assert!(!f.control.handle_remove(&request).await.unwrap());
        assert!(f.pool.is_empty());
    }

    #[tokio::test]
    async fn test_remove_leaves_observed_channel() {
        let f = fixture().await;
        f.control.handle_add(&add("t1", "-100")).await.unwrap();

        let request = RemoveChannelRequest {
            tenant_id: "t1".into(),
            channel_id: "-100".into(),
        };
        assert!(f.control.handle_remove(&request).await.unwrap());
        let session = f.pool.get("t1").unwrap();
        assert!(session.list_observed_channels().is_empty());
        let tenant = TenantRepository::get(f.store.as_ref(), "t1").await.unwrap().unwrap();
        assert!(tenant.channel_ids.is_empty());
    }

    #[tokio::test]
    async fn test_restore_all_rejoins_subscribed_channels() {
        let f = fixture().await;
        let mut tenant = TenantRepository::get(f.store.as_ref(), "t1").await.unwrap().unwrap();
        tenant.subscribe_channel("-100").unwrap();
        tenant.subscribe_channel("-200").unwrap();
        TenantRepository::update(f.store.as_ref(), &tenant).await.unwrap();

        assert_eq!(f.control.restore_all().await.unwrap(), 1);
        let session = f.pool.get("t1").unwrap();
        assert_eq!(
            session.list_observed_channels(),
            vec!["-100".to_string(), "-200".to_string()]
        );
    }
}
