//! Process wiring: builds every component from [`AppConfig`] and runs the
//! long-lived tasks until shutdown.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::cache::TenantConfigCache;
use crate::config::{AppConfig, FeedTransportKind};
use crate::coordination::{system_clock, SharedClock, ShutdownController, ShutdownSignal};
use crate::credentials::{AesGcmCipher, CredentialCipher};
use crate::error::{RelayError, Result};
use crate::execution::{
    ConnectorEquity, ConnectorFactory, ExecutionWorker, IgProvider, PaperProvider,
};
use crate::feed::{
    ChannelControl, FeedConnector, FeedSessionPool, LoopbackHub, SessionContext, WebSocketConnector,
};
use crate::idempotency::{GuardedIdempotency, IdempotencyStore, MemoryIdempotencyStore};
use crate::parser::SignalParser;
use crate::pipeline::{PipelineDeps, PipelineWorker};
use crate::services::{HealthServer, HealthState, Metrics};
use crate::store::{PostgresStore, Repositories};

const PURGE_INTERVAL: Duration = Duration::from_secs(600);
const DB_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Where idempotency claims live, kept concrete for expiry purging
#[derive(Clone)]
pub enum ClaimBackend {
    Memory(Arc<MemoryIdempotencyStore>),
    Postgres(PostgresStore),
}

impl ClaimBackend {
    fn store(&self) -> Arc<dyn IdempotencyStore> {
        match self {
            ClaimBackend::Memory(store) => Arc::clone(store) as Arc<dyn IdempotencyStore>,
            ClaimBackend::Postgres(store) => Arc::new(store.clone()) as Arc<dyn IdempotencyStore>,
        }
    }

    async fn purge(&self) -> Result<u64> {
        match self {
            ClaimBackend::Memory(store) => Ok(store.purge_expired() as u64),
            ClaimBackend::Postgres(store) => store.purge_expired_claims().await,
        }
    }
}

/// Every component of a running relay
pub struct Relay {
    pub config: AppConfig,
    pub bus: MessageBus,
    pub repos: Repositories,
    pub metrics: Arc<Metrics>,
    pub cache: Arc<TenantConfigCache>,
    pub pool: Arc<FeedSessionPool>,
    pub control: Arc<ChannelControl>,
    pub factory: Arc<ConnectorFactory>,
    /// Set when the loopback feed transport is in use
    pub loopback: Option<LoopbackHub>,
    pipeline: PipelineDeps,
    claims: ClaimBackend,
    database: Option<PostgresStore>,
}

/// Inputs that differ between production and tests
pub struct RelayParts {
    pub repos: Repositories,
    pub claims: ClaimBackend,
    pub feed: Arc<dyn FeedConnector>,
    pub loopback: Option<LoopbackHub>,
    pub cipher: Arc<dyn CredentialCipher>,
    pub clock: SharedClock,
    pub database: Option<PostgresStore>,
}

impl Relay {
    /// Build from configuration: connects the database when configured
    pub async fn build(config: AppConfig) -> Result<Self> {
        config.validate().map_err(|errors| RelayError::Validation(errors.join("; ")))?;
        let clock = system_clock();

        let (repos, database) = match &config.database.url {
            Some(url) => {
                let store = PostgresStore::new(url, config.database.max_connections).await?;
                store.migrate().await?;
                (Repositories::postgres(store.clone()), Some(store))
            }
            None => {
                warn!("no database configured, using in-memory stores");
                let (repos, _, _) = Repositories::in_memory();
                (repos, None)
            }
        };

        let claims = match (config.idempotency.backend.as_str(), &database) {
            ("postgres", Some(store)) => ClaimBackend::Postgres(store.clone()),
            _ => ClaimBackend::Memory(Arc::new(MemoryIdempotencyStore::new(clock.clone()))),
        };

        let cipher: Arc<dyn CredentialCipher> = match &config.credentials.key {
            Some(key) => Arc::new(AesGcmCipher::from_base64_key(key)?),
            None if database.is_some() => {
                return Err(RelayError::Credentials(
                    "credentials.key is required with a database".into(),
                ))
            }
            None => {
                warn!("no credentials key configured, using an ephemeral key");
                Arc::new(AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key())?)
            }
        };

        let transport = config.feed.transport;
        let (feed, loopback): (Arc<dyn FeedConnector>, Option<LoopbackHub>) = match transport {
            FeedTransportKind::Websocket => {
                let ws = config.feed.websocket().ok_or_else(|| {
                    RelayError::Validation(
                        "feed.url is required for the websocket transport".into(),
                    )
                })?;
                (Arc::new(WebSocketConnector::new(ws)), None)
            }
            FeedTransportKind::Loopback => {
                let hub = LoopbackHub::new();
                (Arc::new(hub.clone()), Some(hub))
            }
        };

        Ok(Self::from_parts(
            config,
            RelayParts {
                repos,
                claims,
                feed,
                loopback,
                cipher,
                clock,
                database,
            },
        ))
    }

    pub fn from_parts(config: AppConfig, parts: RelayParts) -> Self {
        let RelayParts {
            repos,
            claims,
            feed,
            loopback,
            cipher,
            clock,
            database,
        } = parts;

        let bus = MessageBus::new();
        let metrics = Arc::new(Metrics::new());

        let cache = Arc::new(TenantConfigCache::new(
            repos.tenants.clone(),
            repos.channels.clone(),
            repos.policies.clone(),
            repos.brokers.clone(),
            config.cache.to_cache_config(),
            clock.clone(),
        ));

        let ctx = SessionContext {
            inbound: bus.inbound.clone(),
            session_store: repos.sessions.clone(),
            clock: clock.clone(),
            breaker: config.circuit_breaker.to_breaker_config(),
            connect_timeout: config.feed.connect_timeout(),
            close_timeout: config.feed.close_timeout(),
        };
        let pool = Arc::new(FeedSessionPool::new(
            feed,
            ctx,
            config.pool.to_pool_config(),
            metrics.clone(),
        ));

        let control = Arc::new(ChannelControl::new(
            repos.tenants.clone(),
            pool.clone(),
            cipher.clone(),
            bus.config_changes.clone(),
        ));

        let mut factory = ConnectorFactory::new(repos.brokers.clone(), cipher, clock.clone())
            .with_provider(Arc::new(IgProvider::new(config.ig_config())));
        if config.brokers.paper_enabled {
            factory = factory.with_provider(Arc::new(PaperProvider));
        }
        let factory = Arc::new(factory);

        let pipeline = PipelineDeps {
            idempotency: GuardedIdempotency::new(
                claims.store(),
                config.idempotency.ttl(),
                config.idempotency.on_unavailable,
            ),
            cache: cache.clone(),
            parser: SignalParser::new(),
            reviews: repos.reviews.clone(),
            equity: Arc::new(ConnectorEquity::new(factory.clone())),
            commands: bus.trade_commands.clone(),
            metrics: metrics.clone(),
            clock,
        };

        Self {
            config,
            bus,
            repos,
            metrics,
            cache,
            pool,
            control,
            factory,
            loopback,
            pipeline,
            claims,
            database,
        }
    }

    /// Restore observed channels, start every task and block until shutdown
    pub async fn run(self, shutdown: Arc<ShutdownController>) -> Result<()> {
        match self.control.restore_all().await {
            Ok(restored) => info!(restored, "tenant feed sessions restored"),
            Err(e) => error!(error = %e, "failed to restore feed sessions"),
        }

        let mut workers = self.spawn_workers(&shutdown);
        let mut background = self.spawn_background(&shutdown);

        info!(
            pipeline_workers = self.config.pipeline.workers,
            sessions = self.pool.len(),
            "signal relay running"
        );

        let mut signal = shutdown.signal();
        signal.cancelled().await;

        let pool = self.pool.clone();
        shutdown
            .execute(
                async {
                    join_all(workers.drain(..)).await;
                },
                async move { pool.shutdown_all().await },
            )
            .await;

        for handle in background.drain(..) {
            handle.abort();
        }
        info!("signal relay stopped");
        Ok(())
    }

    /// Pipeline, execution and channel-control tasks: drained on shutdown
    fn spawn_workers(&self, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for id in 0..self.config.pipeline.workers {
            let worker = PipelineWorker::new(id, self.pipeline.clone())
                .with_connector_factory(self.factory.clone());
            let inbound = self.bus.inbound.clone();
            let changes = self.bus.config_changes.clone();
            let signal = shutdown.signal();
            handles.push(tokio::spawn(async move {
                worker.run(inbound, changes, signal).await;
            }));
        }

        let execution = Arc::new(ExecutionWorker::new(
            self.factory.clone(),
            self.metrics.clone(),
            self.config.execution.max_in_flight,
        ));
        handles.push(tokio::spawn(
            execution.run(self.bus.trade_commands.clone(), shutdown.signal()),
        ));

        let control = self.control.clone();
        let queue = self.bus.add_channel.clone();
        let signal = shutdown.signal();
        handles.push(tokio::spawn(async move { control.run_add_loop(queue, signal).await }));

        let control = self.control.clone();
        let queue = self.bus.remove_channel.clone();
        let signal = shutdown.signal();
        handles.push(tokio::spawn(async move { control.run_remove_loop(queue, signal).await }));

        handles
    }

    /// Housekeeping tasks: aborted on shutdown
    fn spawn_background(&self, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let pool = self.pool.clone();
        let signal = shutdown.signal();
        handles.push(tokio::spawn(async move { pool.run_health_loop(signal).await }));

        let claims = self.claims.clone();
        handles.push(tokio::spawn(purge_loop(claims, shutdown.signal())));

        if let Some(port) = self.config.health_port {
            let mut state = HealthState::new(self.pool.clone(), self.metrics.clone());
            if self.database.is_some() {
                state = state.with_database();
            }
            let state = Arc::new(state);

            if let Some(store) = self.database.clone() {
                handles.push(tokio::spawn(db_check_loop(store, state.clone(), shutdown.signal())));
            }

            let server = HealthServer::new(state, port);
            let mut signal = shutdown.signal();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run(async move { signal.cancelled().await }).await {
                    error!(error = %e, "health server stopped");
                }
            }));
        }

        handles
    }
}

async fn purge_loop(claims: ClaimBackend, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match claims.purge().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "expired idempotency claims purged"),
                Err(e) => warn!(error = %e, "idempotency purge failed"),
            },
        }
    }
}

async fn db_check_loop(
    store: PostgresStore,
    state: Arc<HealthState>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(DB_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let ok = sqlx::query("SELECT 1").execute(store.pool()).await.is_ok();
                if !ok {
                    warn!("database health check failed");
                }
                state.record_db_check(ok).await;
            }
        }
    }
}
