//! Pipeline worker
//!
//! Pulls inbound feed messages off the bus and drives each one through the
//! stages in order. Workers compete for messages, so several can run against
//! the same bus. Config-change notifications are applied to the shared cache
//! before the next message is taken.

use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::stages::{self, EquityProvider, Rejection, Verdict};
use crate::bus::Queue;
use crate::cache::TenantConfigCache;
use crate::coordination::{SharedClock, ShutdownSignal};
use crate::domain::{ConfigChange, FeedMessage, NormalizedSignal, TradeCommand};
use crate::error::Result;
use crate::execution::ConnectorFactory;
use crate::idempotency::{ClaimOutcome, GuardedIdempotency};
use crate::parser::SignalParser;
use crate::services::Metrics;
use crate::store::ReviewSink;

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Commands were published (possibly zero if every target was skipped)
    Emitted { commands: usize },
    Dropped(Rejection),
}

/// Everything the worker reads from or writes to
#[derive(Clone)]
pub struct PipelineDeps {
    pub idempotency: GuardedIdempotency,
    pub cache: Arc<TenantConfigCache>,
    pub parser: SignalParser,
    pub reviews: Arc<dyn ReviewSink>,
    pub equity: Arc<dyn EquityProvider>,
    pub commands: Queue<TradeCommand>,
    pub metrics: Arc<Metrics>,
    pub clock: SharedClock,
}

pub struct PipelineWorker {
    id: usize,
    deps: PipelineDeps,
    connectors: Option<Arc<ConnectorFactory>>,
}

macro_rules! proceed {
    ($verdict:expr) => {
        match $verdict {
            Ok(value) => value,
            Err(rejection) => return Ok(Outcome::Dropped(rejection)),
        }
    };
}

macro_rules! pass {
    ($verdict:expr) => {
        match $verdict {
            Ok(value) => value,
            Err(rejection) => return Ok(Err(rejection)),
        }
    };
}

impl PipelineWorker {
    pub fn new(id: usize, deps: PipelineDeps) -> Self {
        Self {
            id,
            deps,
            connectors: None,
        }
    }

    /// Also evict cached broker connectors on broker-scope changes
    pub fn with_connector_factory(mut self, factory: Arc<ConnectorFactory>) -> Self {
        self.connectors = Some(factory);
        self
    }

    /// Run every stage for one message
    ///
    /// A claim taken here is released again if a later stage fails with an
    /// error, so a redelivery of the same message is processed rather than
    /// dropped as a duplicate.
    pub async fn process(&self, message: &FeedMessage) -> Result<Outcome> {
        let deps = &self.deps;

        let claim = proceed!(stages::claim(&deps.idempotency, message).await);
        let commands = match self.route(message).await {
            Ok(verdict) => proceed!(verdict),
            Err(e) => {
                if claim == ClaimOutcome::Claimed {
                    self.release_claim(message).await;
                }
                return Err(e);
            }
        };

        let count = commands.len();
        for command in commands {
            debug!(
                broker_connection = %command.broker_connection_id,
                units = %command.units,
                "trade command emitted"
            );
            deps.commands.publish(command)?;
        }
        Ok(Outcome::Emitted { commands: count })
    }

    /// Stages after the claim: resolve config, parse, check risk, size
    async fn route(&self, message: &FeedMessage) -> Result<Verdict<Vec<TradeCommand>>> {
        let deps = &self.deps;

        let tenant = pass!(stages::resolve_tenant(&deps.cache, &message.tenant_id).await?);
        let channel =
            pass!(stages::resolve_channel(&deps.cache, &tenant.id, &message.channel_id).await?);

        let signal = pass!(stages::parse(&deps.parser, &channel, message)?);
        Span::current().record("correlation_id", signal.hash.as_str());
        debug!(symbol = %signal.symbol, side = %signal.side, "signal parsed");

        let policy = pass!(stages::resolve_policy(&deps.cache, &tenant.id).await?);
        let now = deps.clock.utc_now();
        if let Err(rejection) = stages::validate_risk(&policy, &signal, now) {
            if rejection == Rejection::ManualReview {
                self.record_for_review(&signal).await;
            }
            return Ok(Err(rejection));
        }

        let brokers = pass!(stages::resolve_brokers(&deps.cache, &channel).await?);
        let commands = stages::build_commands(
            &policy,
            &signal,
            &brokers,
            deps.equity.as_ref(),
            &channel.channel_id,
            now,
        )
        .await;

        if commands.is_empty() {
            warn!(targets = brokers.len(), "no broker target could be sized");
        }
        Ok(Ok(commands))
    }

    async fn release_claim(&self, message: &FeedMessage) {
        let key = message.idempotency_key();
        match self.deps.idempotency.release(&key).await {
            Ok(()) => debug!(key = %key, "claim released after failed processing"),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to release claim, redelivery will be dropped")
            }
        }
    }

    async fn record_for_review(&self, signal: &NormalizedSignal) {
        Metrics::inc(&self.deps.metrics.manual_reviews);
        match self.deps.reviews.record(signal, "auto_execute_disabled").await {
            Ok(()) => info!("auto-execute disabled, signal recorded for manual review"),
            Err(e) => error!(error = %e, "failed to record signal for manual review"),
        }
    }

    /// Process one message in isolation: failures are logged and counted,
    /// never propagated to the loop.
    pub async fn handle(&self, message: FeedMessage) -> Option<Outcome> {
        let span = info_span!(
            "message",
            worker = self.id,
            tenant = %message.tenant_id,
            channel = %message.channel_id,
            message = %message.message_id,
            correlation_id = tracing::field::Empty,
        );

        async {
            let metrics = &self.deps.metrics;
            Metrics::inc(&metrics.messages_received);

            match self.process(&message).await {
                Ok(Outcome::Emitted { commands }) => {
                    Metrics::add(&metrics.commands_emitted, commands as u64);
                    info!(commands, "signal routed");
                    Some(Outcome::Emitted { commands })
                }
                Ok(Outcome::Dropped(rejection)) => {
                    metrics.record_drop(rejection.as_str());
                    match &rejection {
                        Rejection::Duplicate => {
                            Metrics::inc(&metrics.duplicates);
                            debug!("duplicate message dropped");
                        }
                        Rejection::ManualReview => {}
                        Rejection::NoBrokers => warn!("no active broker connection to route to"),
                        r if r.is_policy_stop() => {
                            info!(reason = %r, "signal stopped by trading policy")
                        }
                        r => debug!(reason = %r, "message dropped"),
                    }
                    Some(Outcome::Dropped(rejection))
                }
                Err(e) => {
                    Metrics::inc(&metrics.pipeline_errors);
                    error!(error = %e, "message processing failed");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    pub fn apply_change(&self, change: &ConfigChange) {
        self.deps.cache.apply(change);
        if let (ConfigChange::BrokerConnection { connection_id, .. }, Some(factory)) =
            (change, &self.connectors)
        {
            factory.invalidate_connector(*connection_id);
        }
    }

    /// Consume inbound messages and config changes until shutdown
    pub async fn run(
        &self,
        inbound: Queue<FeedMessage>,
        config_changes: Queue<ConfigChange>,
        mut shutdown: ShutdownSignal,
    ) {
        info!(worker = self.id, "pipeline worker started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                change = config_changes.recv() => {
                    if let Some(change) = change {
                        self.apply_change(&change);
                    }
                }
                message = inbound.recv() => {
                    match message {
                        Some(message) => {
                            self.handle(message).await;
                        }
                        None => break,
                    }
                }
            }
        }
        info!(worker = self.id, "pipeline worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::coordination::ManualClock;
    use crate::domain::{
        BrokerConnection, BrokerType, ChannelConfig, SubscriptionTier, Tenant, TradingPolicy,
    };
    use crate::idempotency::{MemoryIdempotencyStore, UnavailablePolicy};
    use crate::store::{
        BrokerConnectionRepository, ChannelRepository, MemoryReviewSink, MemoryStore,
        PolicyRepository, TenantRepository,
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const PATTERN: &str = r"(?i)(?P<side>buy|sell)\s+#?(?P<symbol>[A-Z]{6})(?:\s+(?P<entry>\d+(?:\.\d+)?))?(?:.*?\bSL\s*(?P<sl>\d+(?:\.\d+)?))?";

    struct NoEquity;

    #[async_trait::async_trait]
    impl EquityProvider for NoEquity {
        async fn account_equity(&self, _id: uuid::Uuid) -> Result<rust_decimal::Decimal> {
            Err(crate::error::RelayError::Internal("no equity in tests".into()))
        }
    }

    /// Tenant lookups that fail a set number of times before reaching the store
    struct FlakyTenants {
        inner: Arc<MemoryStore>,
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl TenantRepository for FlakyTenants {
        async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(crate::error::RelayError::Timeout("store unreachable".into()));
            }
            TenantRepository::get(self.inner.as_ref(), tenant_id).await
        }
        async fn list_active(&self) -> Result<Vec<Tenant>> {
            TenantRepository::list_active(self.inner.as_ref()).await
        }
        async fn add(&self, tenant: &Tenant) -> Result<()> {
            TenantRepository::add(self.inner.as_ref(), tenant).await
        }
        async fn update(&self, tenant: &Tenant) -> Result<()> {
            TenantRepository::update(self.inner.as_ref(), tenant).await
        }
        async fn delete(&self, tenant_id: &str) -> Result<bool> {
            TenantRepository::delete(self.inner.as_ref(), tenant_id).await
        }
        async fn exists(&self, tenant_id: &str) -> Result<bool> {
            TenantRepository::exists(self.inner.as_ref(), tenant_id).await
        }
    }

    struct Fixture {
        worker: PipelineWorker,
        idempotency: GuardedIdempotency,
        store: Arc<MemoryStore>,
        reviews: Arc<MemoryReviewSink>,
        commands: Queue<TradeCommand>,
        metrics: Arc<Metrics>,
    }

    async fn fixture(auto_execute: bool) -> Fixture {
        fixture_with_tenant_failures(auto_execute, 0).await
    }

    async fn fixture_with_tenant_failures(auto_execute: bool, failures: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());

        let tenant = Tenant::new("t1", "t1@example.com", SubscriptionTier::Pro).unwrap();
        TenantRepository::add(store.as_ref(), &tenant).await.unwrap();
        let channel = ChannelConfig::new("t1", "-100", PATTERN).unwrap();
        ChannelRepository::add(store.as_ref(), &channel).await.unwrap();
        let mut policy = TradingPolicy::new("t1");
        policy.set_auto_execute(auto_execute);
        PolicyRepository::add(store.as_ref(), &policy).await.unwrap();
        let broker = BrokerConnection::new("t1", BrokerType::Paper, Vec::new());
        BrokerConnectionRepository::add(store.as_ref(), &broker).await.unwrap();

        let tenants = Arc::new(FlakyTenants {
            inner: store.clone(),
            failures: AtomicU32::new(failures),
        });
        let cache = Arc::new(TenantConfigCache::new(
            tenants,
            store.clone(),
            store.clone(),
            store.clone(),
            CacheConfig::default(),
            clock.clone(),
        ));
        let reviews = Arc::new(MemoryReviewSink::new());
        let commands = Queue::new("trade-commands");
        let metrics = Arc::new(Metrics::new());
        let idempotency = GuardedIdempotency::new(
            Arc::new(MemoryIdempotencyStore::new(clock.clone())),
            Duration::from_secs(86_400),
            UnavailablePolicy::Allow,
        );
        let deps = PipelineDeps {
            idempotency: idempotency.clone(),
            cache,
            parser: SignalParser::new(),
            reviews: reviews.clone(),
            equity: Arc::new(NoEquity),
            commands: commands.clone(),
            metrics: metrics.clone(),
            clock,
        };

        Fixture {
            worker: PipelineWorker::new(0, deps),
            idempotency,
            store,
            reviews,
            commands,
            metrics,
        }
    }

    fn message(id: &str, text: &str) -> FeedMessage {
        FeedMessage {
            tenant_id: "t1".into(),
            channel_id: "-100".into(),
            channel_name: None,
            message_id: id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_matching_message_emits_one_command() {
        let f = fixture(true).await;
        let outcome = f.worker.handle(message("1", "SELL EURUSD 1.0850 SL 1.0900")).await;

        assert_eq!(outcome, Some(Outcome::Emitted { commands: 1 }));
        let commands = f.commands.drain();
        assert_eq!(commands[0].symbol, "EURUSD");
        assert_eq!(commands[0].price, Some(dec!(1.0850)));
        assert_eq!(Metrics::get(&f.metrics.commands_emitted), 1);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_dropped_as_duplicate() {
        let f = fixture(true).await;
        f.worker.handle(message("1", "BUY GBPUSD")).await;
        let again = f.worker.handle(message("1", "BUY GBPUSD")).await;

        assert_eq!(again, Some(Outcome::Dropped(Rejection::Duplicate)));
        assert_eq!(f.commands.drain().len(), 1);
        assert_eq!(Metrics::get(&f.metrics.duplicates), 1);
    }

    #[tokio::test]
    async fn test_store_error_releases_claim_for_redelivery() {
        let f = fixture_with_tenant_failures(true, 1).await;
        let msg = message("1", "BUY GBPUSD");

        assert_eq!(f.worker.handle(msg.clone()).await, None);
        assert_eq!(Metrics::get(&f.metrics.pipeline_errors), 1);
        assert!(!f.idempotency.is_claimed(&msg.idempotency_key()).await.unwrap());
        assert!(f.commands.drain().is_empty());

        assert_eq!(f.worker.handle(msg.clone()).await, Some(Outcome::Emitted { commands: 1 }));
        assert!(f.idempotency.is_claimed(&msg.idempotency_key()).await.unwrap());
        assert_eq!(f.commands.drain().len(), 1);
        assert_eq!(Metrics::get(&f.metrics.duplicates), 0);
    }

    #[tokio::test]
    async fn test_rejection_keeps_claim() {
        let f = fixture(true).await;
        let msg = message("1", "good morning traders");

        assert_eq!(
            f.worker.handle(msg.clone()).await,
            Some(Outcome::Dropped(Rejection::NoMatch))
        );
        assert!(f.idempotency.is_claimed(&msg.idempotency_key()).await.unwrap());
        assert_eq!(f.worker.handle(msg).await, Some(Outcome::Dropped(Rejection::Duplicate)));
    }

    #[tokio::test]
    async fn test_auto_execute_off_records_review_and_emits_nothing() {
        let f = fixture(false).await;
        let outcome = f.worker.handle(message("1", "BUY GBPUSD")).await;

        assert_eq!(outcome, Some(Outcome::Dropped(Rejection::ManualReview)));
        assert!(f.commands.drain().is_empty());
        assert_eq!(f.reviews.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_text_is_dropped() {
        let f = fixture(true).await;
        let outcome = f.worker.handle(message("1", "good morning traders")).await;
        assert_eq!(outcome, Some(Outcome::Dropped(Rejection::NoMatch)));
        assert_eq!(f.metrics.drops("no_match"), 1);
    }

    #[tokio::test]
    async fn test_config_change_invalidates_cached_channel() {
        let f = fixture(true).await;
        f.worker.handle(message("1", "BUY GBPUSD")).await;

        let mut channel = ChannelRepository::find(f.store.as_ref(), "t1", "-100")
            .await
            .unwrap()
            .unwrap();
        channel.disable();
        ChannelRepository::update(f.store.as_ref(), &channel).await.unwrap();

        // Still cached
        assert_eq!(
            f.worker.handle(message("2", "BUY GBPUSD")).await,
            Some(Outcome::Emitted { commands: 1 })
        );

        f.worker.apply_change(&ConfigChange::Channel {
            tenant_id: "t1".into(),
            channel_id: "-100".into(),
        });
        assert_eq!(
            f.worker.handle(message("3", "BUY GBPUSD")).await,
            Some(Outcome::Dropped(Rejection::ChannelDisabled))
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(true).await;
        let controller = crate::coordination::ShutdownController::with_defaults();
        let inbound = Queue::new("inbound-messages");
        let changes = Queue::new("config-changes");
        inbound.publish(message("1", "BUY GBPUSD")).unwrap();

        let worker = Arc::new(f.worker);
        let handle = {
            let worker = worker.clone();
            let signal = controller.signal();
            tokio::spawn(async move { worker.run(inbound, changes, signal).await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.commands.published() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        controller.request_shutdown(crate::coordination::ShutdownReason::Requested);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
