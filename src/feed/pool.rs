//! Feed Session Pool
//!
//! Owns every tenant's [`ResilientFeedSession`]. Lookups go through a
//! concurrent map; creation is serialized by one pool-wide lock with a
//! double-checked insert.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{ResilientFeedSession, SessionContext};
use super::transport::FeedConnector;
use crate::coordination::ShutdownSignal;
use crate::credentials::FeedCredentials;
use crate::error::{RelayError, Result};
use crate::services::Metrics;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft limit; exceeding it only logs a warning
    pub max_sessions: usize,
    pub health_check_interval: Duration,
    /// Degraded or circuit-open sessions are left alone this long before being rebuilt
    pub recovery_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            health_check_interval: Duration::from_secs(30),
            recovery_grace: Duration::from_secs(120),
        }
    }
}

/// Channels of an evicted session, waiting to be joined on its replacement
struct PendingRestore {
    credentials: FeedCredentials,
    channels: BTreeSet<String>,
}

pub struct FeedSessionPool {
    sessions: DashMap<String, Arc<ResilientFeedSession>>,
    pending: DashMap<String, PendingRestore>,
    unhealthy_since: DashMap<String, Instant>,
    creation_lock: Mutex<()>,
    connector: Arc<dyn FeedConnector>,
    ctx: SessionContext,
    config: PoolConfig,
    metrics: Arc<Metrics>,
    running: AtomicBool,
}

impl FeedSessionPool {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        ctx: SessionContext,
        config: PoolConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            unhealthy_since: DashMap::new(),
            creation_lock: Mutex::new(()),
            connector,
            ctx,
            config,
            metrics,
            running: AtomicBool::new(true),
        }
    }

    /// Return the tenant's healthy session, creating and connecting one if needed.
    ///
    /// A replacement for an evicted session re-joins every channel the old one observed.
    pub async fn get_or_create(
        &self,
        tenant_id: &str,
        credentials: FeedCredentials,
    ) -> Result<Arc<ResilientFeedSession>> {
        if !self.is_running() {
            return Err(RelayError::SessionUnavailable("session pool is shut down".into()));
        }

        if let Some(session) = self.healthy_or_evict(tenant_id).await {
            return Ok(session);
        }

        let _creation = self.creation_lock.lock().await;

        // Another caller may have finished creating it while we waited.
        if let Some(session) = self.healthy_or_evict(tenant_id).await {
            return Ok(session);
        }

        self.create_locked(tenant_id, credentials).await
    }

    /// Build, connect, re-join and insert. Caller holds the creation lock.
    async fn create_locked(
        &self,
        tenant_id: &str,
        credentials: FeedCredentials,
    ) -> Result<Arc<ResilientFeedSession>> {
        if self.sessions.len() >= self.config.max_sessions {
            warn!(
                sessions = self.sessions.len(),
                max_sessions = self.config.max_sessions,
                "feed session count above configured maximum"
            );
        }

        let session =
            ResilientFeedSession::start(tenant_id, credentials, self.connector.as_ref(), &self.ctx);
        if let Err(e) = session.connect().await {
            warn!(tenant = tenant_id, error = %e, "feed session failed to connect");
            session.dispose().await;
            return Err(e);
        }

        match self.sessions.entry(tenant_id.to_string()) {
            Entry::Occupied(_) => {
                session.dispose().await;
                return Err(RelayError::SessionUnavailable(format!(
                    "lost creation race for tenant {}",
                    tenant_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
            }
        }
        Metrics::inc(&self.metrics.sessions_created);
        info!(tenant = tenant_id, sessions = self.sessions.len(), "feed session created");

        self.rejoin_pending(&session).await;
        Ok(session)
    }

    /// Join the channels an evicted session left behind. Failures stay pending.
    async fn rejoin_pending(&self, session: &ResilientFeedSession) {
        let tenant_id = session.tenant_id();
        let Some((_, pending)) = self.pending.remove(tenant_id) else {
            return;
        };

        let mut failed = BTreeSet::new();
        for channel in &pending.channels {
            if let Err(e) = session.add_channel(channel).await {
                warn!(
                    tenant = tenant_id,
                    channel = %channel,
                    error = %e,
                    "re-join failed, will retry"
                );
                failed.insert(channel.clone());
            }
        }
        info!(
            tenant = tenant_id,
            rejoined = pending.channels.len() - failed.len(),
            failed = failed.len(),
            "restored channels on replacement feed session"
        );
        if !failed.is_empty() {
            self.stash(tenant_id, pending.credentials, failed);
        }
    }

    fn stash(&self, tenant_id: &str, credentials: FeedCredentials, channels: BTreeSet<String>) {
        match self.pending.entry(tenant_id.to_string()) {
            Entry::Occupied(mut slot) => slot.get_mut().channels.extend(channels),
            Entry::Vacant(slot) => {
                slot.insert(PendingRestore { credentials, channels });
            }
        }
    }

    /// Remove a session from the map, remember its channels, and dispose it.
    async fn evict(&self, session: &Arc<ResilientFeedSession>) -> bool {
        let tenant_id = session.tenant_id();
        let removed = self
            .sessions
            .remove_if(tenant_id, |_, s| Arc::ptr_eq(s, session));
        if removed.is_none() {
            return false;
        }
        self.unhealthy_since.remove(tenant_id);
        self.stash(
            tenant_id,
            session.credentials().clone(),
            session.list_observed_channels().into_iter().collect(),
        );
        session.dispose().await;
        Metrics::inc(&self.metrics.sessions_evicted);
        true
    }

    /// Fast path: return a healthy session, or evict an unhealthy one.
    async fn healthy_or_evict(&self, tenant_id: &str) -> Option<Arc<ResilientFeedSession>> {
        let existing = self.sessions.get(tenant_id).map(|s| Arc::clone(s.value()))?;
        if existing.is_connected() {
            existing.touch();
            return Some(existing);
        }

        debug!(tenant = tenant_id, state = %existing.state(), "evicting unhealthy feed session");
        self.evict(&existing).await;
        None
    }

    /// Existing session without creating one
    pub fn get(&self, tenant_id: &str) -> Option<Arc<ResilientFeedSession>> {
        self.sessions.get(tenant_id).map(|s| Arc::clone(s.value()))
    }

    /// Remove and dispose a tenant's session. Returns false if there was none.
    pub async fn remove(&self, tenant_id: &str) -> bool {
        self.pending.remove(tenant_id);
        self.unhealthy_since.remove(tenant_id);
        match self.sessions.remove(tenant_id) {
            Some((_, session)) => {
                session.dispose().await;
                info!(tenant = tenant_id, "feed session removed");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, tenant_id: &str) -> bool {
        self.sessions
            .get(tenant_id)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }

    /// Tenants whose channels are waiting for a replacement session
    pub fn pending_restores(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }

    /// Evict sessions that are dead or have not recovered within the grace
    /// period, then rebuild every evicted tenant with its channels.
    /// Returns how many sessions were evicted.
    pub async fn check_health(&self) -> usize {
        let now = self.ctx.clock.now();
        let sessions: Vec<Arc<ResilientFeedSession>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        let mut evicted = 0;
        for session in sessions {
            let tenant_id = session.tenant_id();
            if session.is_connected() {
                self.unhealthy_since.remove(tenant_id);
                continue;
            }
            if session.is_recovering() {
                let since = *self
                    .unhealthy_since
                    .entry(tenant_id.to_string())
                    .or_insert(now);
                let waited = now.saturating_duration_since(since);
                if waited < self.config.recovery_grace {
                    debug!(
                        tenant = tenant_id,
                        state = %session.state(),
                        breaker = %session.breaker().state(),
                        waited_secs = waited.as_secs(),
                        "feed session recovering"
                    );
                    continue;
                }
            }
            warn!(
                tenant = tenant_id,
                state = %session.state(),
                breaker = %session.breaker().state(),
                "health check evicting feed session"
            );
            if self.evict(&session).await {
                evicted += 1;
            }
        }

        self.restore_pending().await;
        evicted
    }

    /// Recreate sessions for tenants whose channels are still pending.
    async fn restore_pending(&self) {
        let tenants = self.pending_restores();
        if tenants.is_empty() || !self.is_running() {
            return;
        }

        let _creation = self.creation_lock.lock().await;
        for tenant_id in tenants {
            if let Some(session) = self.get(&tenant_id) {
                if session.is_connected() {
                    self.rejoin_pending(&session).await;
                }
                continue;
            }
            let credentials = self.pending.get(&tenant_id).map(|p| p.credentials.clone());
            let Some(credentials) = credentials else {
                continue;
            };
            if let Err(e) = self.create_locked(&tenant_id, credentials).await {
                warn!(tenant = %tenant_id, error = %e, "feed session rebuild failed, will retry");
            }
        }
    }

    /// Periodic health checks until shutdown
    pub async fn run_health_loop(&self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.check_health().await;
                    if evicted > 0 {
                        info!(evicted, sessions = self.sessions.len(), "feed session health check");
                    }
                }
            }
        }
        debug!("feed session health loop stopped");
    }

    /// Dispose every session concurrently and wait for all of them.
    pub async fn shutdown_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _creation = self.creation_lock.lock().await;

        let tenants: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<Arc<ResilientFeedSession>> = tenants
            .iter()
            .filter_map(|t| self.sessions.remove(t).map(|(_, s)| s))
            .collect();
        self.pending.clear();

        info!(sessions = sessions.len(), "closing all feed sessions");
        join_all(sessions.iter().map(|s| s.dispose())).await;
        info!("all feed sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Queue;
    use crate::coordination::{CircuitBreakerConfig, ManualClock};
    use crate::feed::loopback::LoopbackHub;
    use crate::feed::transport::ConnectionState;
    use crate::store::MemorySessionStore;

    fn pool(hub: &LoopbackHub) -> FeedSessionPool {
        pool_with_clock(hub).0
    }

    fn pool_with_clock(hub: &LoopbackHub) -> (FeedSessionPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let ctx = SessionContext {
            inbound: Queue::new("inbound-messages"),
            session_store: Arc::new(MemorySessionStore::new()),
            clock: clock.clone(),
            breaker: CircuitBreakerConfig::default(),
            connect_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(200),
        };
        let pool = FeedSessionPool::new(
            Arc::new(hub.clone()),
            ctx,
            PoolConfig::default(),
            Arc::new(Metrics::new()),
        );
        (pool, clock)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn creds() -> FeedCredentials {
        FeedCredentials {
            account: "acct".into(),
            token: "tok".into(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_healthy_session() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);

        let a = pool.get_or_create("t1", creds()).await.unwrap();
        let b = pool.get_or_create("t1", creds()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool.is_active("t1"));
        assert_eq!(Metrics::get(&pool.metrics.sessions_created), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_builds_one_session() {
        let hub = LoopbackHub::new();
        let pool = Arc::new(pool(&hub));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = pool.clone();
            handles.push(tokio::spawn(async move { p.get_or_create("t1", creds()).await }));
        }
        let sessions: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(pool.len(), 1);
        assert_eq!(hub.transport("t1").unwrap().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_session_is_replaced_with_its_channels() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);

        let first = pool.get_or_create("t1", creds()).await.unwrap();
        first.add_channel("-100").await.unwrap();
        for _ in 0..5 {
            first.breaker().record_failure("boom");
        }
        assert!(!pool.is_active("t1"));

        let second = pool.get_or_create("t1", creds()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_disposed());
        assert!(pool.is_active("t1"));
        assert_eq!(second.list_observed_channels(), vec!["-100".to_string()]);
        assert_eq!(hub.transport("t1").unwrap().joined_channels(), vec!["-100".to_string()]);
        assert!(pool.pending_restores().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_inserted() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);
        hub.fail_next(1);

        assert!(pool.get_or_create("t1", creds()).await.is_err());
        assert!(pool.is_empty());
        assert!(pool.get_or_create("t1", creds()).await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_rebuilds_closed_session_and_traffic_resumes() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);
        pool.get_or_create("t1", creds()).await.unwrap();
        let old = pool.get_or_create("t2", creds()).await.unwrap();
        old.add_channel("-100").await.unwrap();
        old.add_channel("-200").await.unwrap();

        hub.transport("t2").unwrap().set_state(ConnectionState::Closed);
        settle().await;

        assert_eq!(pool.check_health().await, 1);
        assert_eq!(pool.tenants(), vec!["t1".to_string(), "t2".to_string()]);
        let rebuilt = pool.get("t2").unwrap();
        assert!(!Arc::ptr_eq(&old, &rebuilt));
        assert!(rebuilt.is_connected());
        assert_eq!(rebuilt.list_observed_channels(), vec!["-100".to_string(), "-200".to_string()]);

        assert!(hub.inject("t2", "-100", "1", "BUY EURUSD"));
        settle().await;
        let delivered = pool.ctx.inbound.drain();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].channel_id, "-100");
    }

    #[tokio::test]
    async fn test_degraded_session_is_given_time_to_recover() {
        let hub = LoopbackHub::new();
        let (pool, clock) = pool_with_clock(&hub);
        let session = pool.get_or_create("t1", creds()).await.unwrap();
        session.add_channel("-100").await.unwrap();
        session.add_channel("-200").await.unwrap();
        let transport = hub.transport("t1").unwrap();

        transport.set_state(ConnectionState::Degraded);
        settle().await;
        assert!(session.is_recovering());
        assert_eq!(pool.check_health().await, 0);
        assert!(Arc::ptr_eq(&session, &pool.get("t1").unwrap()));

        transport.set_state(ConnectionState::Ready);
        settle().await;
        assert_eq!(pool.check_health().await, 0);
        assert!(pool.is_active("t1"));

        transport.set_state(ConnectionState::Degraded);
        settle().await;
        assert_eq!(pool.check_health().await, 0);
        clock.advance(PoolConfig::default().recovery_grace);
        assert_eq!(pool.check_health().await, 1);

        let rebuilt = pool.get("t1").unwrap();
        assert!(!Arc::ptr_eq(&session, &rebuilt));
        assert_eq!(rebuilt.list_observed_channels(), vec!["-100".to_string(), "-200".to_string()]);
        assert!(hub.inject("t1", "-200", "9", "SELL XAUUSD"));
        settle().await;
        assert_eq!(pool.ctx.inbound.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_session_is_not_evicted_by_health_check() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);
        let session = pool.get_or_create("t1", creds()).await.unwrap();
        for _ in 0..5 {
            session.breaker().record_failure("boom");
        }

        assert!(session.is_recovering());
        assert_eq!(pool.check_health().await, 0);
        assert!(Arc::ptr_eq(&session, &pool.get("t1").unwrap()));
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_channels_pending() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);
        let session = pool.get_or_create("t1", creds()).await.unwrap();
        session.add_channel("-100").await.unwrap();
        hub.transport("t1").unwrap().set_state(ConnectionState::Closed);
        settle().await;

        // the old transport's close and the rebuild's connect both fail
        hub.fail_next(2);
        assert_eq!(pool.check_health().await, 1);
        assert!(pool.get("t1").is_none());
        assert_eq!(pool.pending_restores(), vec!["t1".to_string()]);

        assert_eq!(pool.check_health().await, 0);
        let rebuilt = pool.get("t1").unwrap();
        assert_eq!(rebuilt.list_observed_channels(), vec!["-100".to_string()]);
        assert!(pool.pending_restores().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all_disposes_everything() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);
        let a = pool.get_or_create("t1", creds()).await.unwrap();
        let b = pool.get_or_create("t2", creds()).await.unwrap();

        pool.shutdown_all().await;
        assert!(pool.is_empty());
        assert!(a.is_disposed() && b.is_disposed());
        assert!(pool.get_or_create("t3", creds()).await.is_err());
    }

    #[tokio::test]
    async fn test_remove() {
        let hub = LoopbackHub::new();
        let pool = pool(&hub);
        let session = pool.get_or_create("t1", creds()).await.unwrap();
        assert!(pool.remove("t1").await);
        assert!(!pool.remove("t1").await);
        assert!(session.is_disposed());
    }
}
