use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use signal_relay::bus::Queue;
use signal_relay::cache::{CacheConfig, TenantConfigCache};
use signal_relay::config::AppConfig;
use signal_relay::coordination::{system_clock, ShutdownController, ShutdownReason};
use signal_relay::credentials::{self, AesGcmCipher, FeedCredentials};
use signal_relay::domain::{
    AddChannelRequest, BrokerConnection, BrokerType, ChannelConfig, FeedMessage, Side,
    SubscriptionTier, Tenant, TradeCommand, TradingPolicy,
};
use signal_relay::error::{RelayError, Result};
use signal_relay::feed::LoopbackHub;
use signal_relay::idempotency::{GuardedIdempotency, MemoryIdempotencyStore, UnavailablePolicy};
use signal_relay::parser::{SignalParser, DEFAULT_SIGNAL_PATTERN};
use signal_relay::pipeline::{EquityProvider, Outcome, PipelineDeps, PipelineWorker, Rejection};
use signal_relay::runtime::{ClaimBackend, Relay, RelayParts};
use signal_relay::services::Metrics;
use signal_relay::store::{
    BrokerConnectionRepository, ChannelRepository, MemoryStore, PolicyRepository, Repositories,
    TenantRepository,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct FixedEquity;

#[async_trait::async_trait]
impl EquityProvider for FixedEquity {
    async fn account_equity(&self, _id: Uuid) -> Result<Decimal> {
        Ok(dec!(10000))
    }
}

struct Harness {
    worker: PipelineWorker,
    store: Arc<MemoryStore>,
    commands: Queue<TradeCommand>,
}

async fn harness(channel: ChannelConfig) -> Harness {
    let (repos, store, reviews) = Repositories::in_memory();
    let clock = system_clock();

    let tenant = Tenant::new("acme", "ops@acme.test", SubscriptionTier::Pro).unwrap();
    TenantRepository::add(store.as_ref(), &tenant).await.unwrap();
    ChannelRepository::add(store.as_ref(), &channel).await.unwrap();
    let mut policy = TradingPolicy::new("acme");
    policy.set_auto_execute(true);
    PolicyRepository::add(store.as_ref(), &policy).await.unwrap();

    let cache = Arc::new(TenantConfigCache::new(
        repos.tenants.clone(),
        repos.channels.clone(),
        repos.policies.clone(),
        repos.brokers.clone(),
        CacheConfig::default(),
        clock.clone(),
    ));
    let commands = Queue::new("trade-commands");
    let deps = PipelineDeps {
        idempotency: GuardedIdempotency::new(
            Arc::new(MemoryIdempotencyStore::new(clock.clone())),
            Duration::from_secs(86_400),
            UnavailablePolicy::Allow,
        ),
        cache,
        parser: SignalParser::new(),
        reviews,
        equity: Arc::new(FixedEquity),
        commands: commands.clone(),
        metrics: Arc::new(Metrics::new()),
        clock,
    };

    Harness {
        worker: PipelineWorker::new(0, deps),
        store,
        commands,
    }
}

async fn add_broker(store: &MemoryStore) -> Uuid {
    let broker = BrokerConnection::new("acme", BrokerType::Paper, Vec::new());
    BrokerConnectionRepository::add(store, &broker).await.unwrap();
    broker.id
}

fn message(id: &str, text: &str) -> FeedMessage {
    FeedMessage {
        tenant_id: "acme".into(),
        channel_id: "-1001".into(),
        channel_name: Some("Gold Signals".into()),
        message_id: id.into(),
        text: text.into(),
        timestamp: Utc::now(),
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn gold_limit_signal_becomes_one_command() {
    let channel = ChannelConfig::new("acme", "-1001", DEFAULT_SIGNAL_PATTERN).unwrap();
    let h = harness(channel).await;
    add_broker(&h.store).await;

    let outcome = h
        .worker
        .handle(message("42", "Buy #XAUUSD 3750.5 SL 3740 TP 3753 TP 3760"))
        .await;
    assert_eq!(outcome, Some(Outcome::Emitted { commands: 1 }));

    let commands = h.commands.drain();
    assert_eq!(commands.len(), 1);
    let cmd = &commands[0];
    assert_eq!(cmd.symbol, "XAUUSD");
    assert_eq!(cmd.side, Side::Buy);
    assert_eq!(cmd.price, Some(dec!(3750.5)));
    assert_eq!(cmd.stop_loss, Some(dec!(3740)));
    assert_eq!(cmd.take_profit, Some(dec!(3753)));
    assert_eq!(cmd.units, dec!(1));
    assert_eq!(cmd.source_channel_id.as_deref(), Some("-1001"));
}

#[tokio::test]
async fn explicit_brokers_fan_out_with_one_correlation_id() {
    let brokers: Vec<BrokerConnection> = (0..3)
        .map(|_| BrokerConnection::new("acme", BrokerType::Paper, Vec::new()))
        .collect();
    let ids: Vec<Uuid> = brokers.iter().map(|b| b.id).collect();

    let channel = ChannelConfig::new("acme", "-1001", DEFAULT_SIGNAL_PATTERN)
        .unwrap()
        .with_brokers(ids.clone());
    let h = harness(channel).await;
    for broker in &brokers {
        BrokerConnectionRepository::add(h.store.as_ref(), broker).await.unwrap();
    }
    // a fourth active connection that the channel does not name
    add_broker(&h.store).await;

    let outcome = h.worker.handle(message("7", "SELL EURUSD 1.0850 SL 1.0900")).await;
    assert_eq!(outcome, Some(Outcome::Emitted { commands: 3 }));

    let commands = h.commands.drain();
    let targeted: Vec<Uuid> = commands.iter().map(|c| c.broker_connection_id).collect();
    assert_eq!(targeted, ids);
    assert!(commands.iter().all(|c| c.correlation_id == commands[0].correlation_id));
}

#[tokio::test]
async fn disabled_channel_emits_nothing() {
    let mut channel = ChannelConfig::new("acme", "-1001", DEFAULT_SIGNAL_PATTERN).unwrap();
    channel.disable();
    let h = harness(channel).await;
    add_broker(&h.store).await;

    let outcome = h.worker.handle(message("1", "BUY GBPUSD 1.2700")).await;
    assert_eq!(outcome, Some(Outcome::Dropped(Rejection::ChannelDisabled)));
    assert!(h.commands.drain().is_empty());
}

#[tokio::test]
async fn loopback_feed_to_paper_fill() {
    let (repos, store, _) = Repositories::in_memory();
    let cipher = Arc::new(AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap());
    let hub = LoopbackHub::new();

    let blob = credentials::seal(
        cipher.as_ref(),
        &FeedCredentials {
            account: "acme-feed".into(),
            token: "secret".into(),
        },
    )
    .unwrap();
    let tenant = Tenant::new("acme", "ops@acme.test", SubscriptionTier::Pro)
        .unwrap()
        .with_feed_credentials(blob);
    TenantRepository::add(store.as_ref(), &tenant).await.unwrap();
    let channel = ChannelConfig::new("acme", "-1001", DEFAULT_SIGNAL_PATTERN).unwrap();
    ChannelRepository::add(store.as_ref(), &channel).await.unwrap();
    let mut policy = TradingPolicy::new("acme");
    policy.set_auto_execute(true);
    PolicyRepository::add(store.as_ref(), &policy).await.unwrap();
    add_broker(&store).await;

    let clock = system_clock();
    let relay = Relay::from_parts(
        AppConfig::default(),
        RelayParts {
            repos,
            claims: ClaimBackend::Memory(Arc::new(MemoryIdempotencyStore::new(clock.clone()))),
            feed: Arc::new(hub.clone()),
            loopback: Some(hub.clone()),
            cipher,
            clock,
            database: None,
        },
    );
    let metrics = relay.metrics.clone();
    let pool = relay.pool.clone();
    relay
        .bus
        .add_channel
        .publish(AddChannelRequest {
            tenant_id: "acme".into(),
            channel_id: "-1001".into(),
            channel_name: Some("Gold Signals".into()),
        })
        .unwrap();

    let shutdown = Arc::new(ShutdownController::with_defaults());
    let running = tokio::spawn(relay.run(shutdown.clone()));

    eventually("channel to be observed", || {
        let pool = pool.clone();
        async move {
            pool.get("acme")
                .map(|s| s.is_connected() && s.is_observing("-1001"))
                .unwrap_or(false)
        }
    })
    .await;

    assert!(hub.inject("acme", "-1001", "900", "Buy #XAUUSD 3750.5 SL 3740 TP 3753"));
    // redelivery of the same message id must not trade twice
    assert!(hub.inject("acme", "-1001", "900", "Buy #XAUUSD 3750.5 SL 3740 TP 3753"));
    // unobserved channel is discarded at the session
    assert!(hub.inject("acme", "-2002", "901", "Sell #EURUSD"));

    eventually("paper fill", || {
        let metrics = metrics.clone();
        async move {
            Metrics::get(&metrics.orders_accepted) == 1 && Metrics::get(&metrics.duplicates) == 1
        }
    })
    .await;

    shutdown.request_shutdown(ShutdownReason::Requested);
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(Metrics::get(&metrics.orders_accepted), 1);
    assert_eq!(Metrics::get(&metrics.messages_received), 2);
    assert!(!pool.is_running());

    let stored = TenantRepository::get(store.as_ref(), "acme").await.unwrap().unwrap();
    assert!(stored.channel_ids.contains(&"-1001".to_string()));
}

#[tokio::test]
async fn inactive_broker_connection_is_refused() {
    let (repos, store, _) = Repositories::in_memory();
    let mut broker = BrokerConnection::new("acme", BrokerType::Paper, Vec::new());
    broker.deactivate();
    BrokerConnectionRepository::add(store.as_ref(), &broker).await.unwrap();

    let cipher = Arc::new(AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap());
    let factory = signal_relay::execution::ConnectorFactory::new(
        repos.brokers.clone(),
        cipher,
        system_clock(),
    )
    .with_provider(Arc::new(signal_relay::execution::PaperProvider));

    match factory.get_connector(broker.id).await {
        Err(RelayError::InactiveBrokerConnection(id)) => assert_eq!(id, broker.id),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("inactive connection produced a connector"),
    }
}
