use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connector::{BrokerConnector, ConnectorProvider};
use crate::coordination::SharedClock;
use crate::credentials::{self, BrokerCredentials, CredentialCipher};
use crate::domain::BrokerType;
use crate::error::{RelayError, Result};
use crate::pipeline::EquityProvider;
use crate::store::BrokerConnectionRepository;

/// Resolves broker connection ids to live, validated connectors.
///
/// Connectors are cached per connection id. A cached connector is reused
/// until [`ConnectorFactory::invalidate_connector`] drops it, which the
/// pipeline does when the connection's configuration changes.
pub struct ConnectorFactory {
    brokers: Arc<dyn BrokerConnectionRepository>,
    cipher: Arc<dyn CredentialCipher>,
    providers: HashMap<BrokerType, Arc<dyn ConnectorProvider>>,
    connectors: DashMap<Uuid, Arc<dyn BrokerConnector>>,
    clock: SharedClock,
}

impl ConnectorFactory {
    pub fn new(
        brokers: Arc<dyn BrokerConnectionRepository>,
        cipher: Arc<dyn CredentialCipher>,
        clock: SharedClock,
    ) -> Self {
        Self {
            brokers,
            cipher,
            providers: HashMap::new(),
            connectors: DashMap::new(),
            clock,
        }
    }

    /// Register the provider for its broker type, replacing any previous one
    pub fn with_provider(mut self, provider: Arc<dyn ConnectorProvider>) -> Self {
        self.providers.insert(provider.broker_type(), provider);
        self
    }

    pub fn supports(&self, broker_type: BrokerType) -> bool {
        self.providers.contains_key(&broker_type)
    }

    /// Cached connector for `connection_id`, building and validating one on miss
    pub async fn get_connector(&self, connection_id: Uuid) -> Result<Arc<dyn BrokerConnector>> {
        if let Some(connector) = self.connectors.get(&connection_id) {
            return Ok(Arc::clone(connector.value()));
        }

        let connection = self
            .brokers
            .get(connection_id)
            .await?
            .ok_or_else(|| RelayError::not_found("broker connection", connection_id))?;
        if !connection.active {
            return Err(RelayError::InactiveBrokerConnection(connection_id));
        }

        let provider = self
            .providers
            .get(&connection.broker_type)
            .ok_or_else(|| RelayError::UnsupportedBrokerType(connection.broker_type.to_string()))?;

        let creds = if provider.requires_credentials() {
            if connection.credentials.is_empty() {
                return Err(RelayError::Credentials(format!(
                    "broker connection {} has no credentials",
                    connection_id
                )));
            }
            Some(credentials::open::<BrokerCredentials>(
                self.cipher.as_ref(),
                &connection.credentials,
            )?)
        } else {
            None
        };

        let connector = provider.create(&connection, creds).await?;
        connector.validate_connection().await?;

        if let Err(e) = self
            .brokers
            .touch_last_used(connection_id, self.clock.utc_now())
            .await
        {
            warn!(broker_connection = %connection_id, error = %e, "failed to record last use");
        }

        info!(
            tenant = %connection.tenant_id,
            broker_connection = %connection_id,
            broker = %connection.broker_type,
            "broker connector ready"
        );

        // Another task may have built one concurrently; keep whichever landed first
        let cached = self
            .connectors
            .entry(connection_id)
            .or_insert(connector)
            .value()
            .clone();
        Ok(cached)
    }

    /// Drop the cached connector so the next use rebuilds it
    pub fn invalidate_connector(&self, connection_id: Uuid) -> bool {
        let removed = self.connectors.remove(&connection_id).is_some();
        if removed {
            debug!(broker_connection = %connection_id, "connector invalidated");
        }
        removed
    }

    pub fn clear_all(&self) {
        self.connectors.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.connectors.len()
    }
}

/// Equity lookups routed through the broker connectors
pub struct ConnectorEquity {
    factory: Arc<ConnectorFactory>,
}

impl ConnectorEquity {
    pub fn new(factory: Arc<ConnectorFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl EquityProvider for ConnectorEquity {
    async fn account_equity(&self, broker_connection_id: Uuid) -> Result<Decimal> {
        self.factory
            .get_connector(broker_connection_id)
            .await?
            .account_equity()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::system_clock;
    use crate::credentials::AesGcmCipher;
    use crate::domain::BrokerConnection;
    use crate::execution::PaperProvider;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        creates: AtomicU32,
        saw_credentials: AtomicU32,
    }

    #[async_trait]
    impl ConnectorProvider for CountingProvider {
        fn broker_type(&self) -> BrokerType {
            BrokerType::Ig
        }

        async fn create(
            &self,
            connection: &BrokerConnection,
            credentials: Option<BrokerCredentials>,
        ) -> Result<Arc<dyn BrokerConnector>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if let Some(creds) = credentials {
                assert_eq!(creds.username, "alice");
                self.saw_credentials.fetch_add(1, Ordering::SeqCst);
            }
            PaperProvider.create(connection, None).await
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<AesGcmCipher>) {
        let key = AesGcmCipher::generate_key();
        let cipher = Arc::new(AesGcmCipher::from_base64_key(&key).unwrap());
        (Arc::new(MemoryStore::new()), cipher)
    }

    fn ig_credentials() -> BrokerCredentials {
        BrokerCredentials {
            username: "alice".into(),
            password: "pw".into(),
            api_key: "k".into(),
            account_id: None,
            demo: true,
        }
    }

    #[tokio::test]
    async fn test_connector_cached_and_credentials_decrypted() {
        let (store, cipher) = setup();
        let blob = credentials::seal(cipher.as_ref(), &ig_credentials()).unwrap();
        let conn = BrokerConnection::new("t1", BrokerType::Ig, blob);
        BrokerConnectionRepository::add(store.as_ref(), &conn).await.unwrap();

        let provider = Arc::new(CountingProvider {
            creates: AtomicU32::new(0),
            saw_credentials: AtomicU32::new(0),
        });
        let factory = ConnectorFactory::new(store.clone(), cipher, system_clock())
            .with_provider(provider.clone());

        let a = factory.get_connector(conn.id).await.unwrap();
        let b = factory.get_connector(conn.id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
        assert_eq!(provider.saw_credentials.load(Ordering::SeqCst), 1);

        let stored = BrokerConnectionRepository::get(store.as_ref(), conn.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.last_used_at.is_some());

        assert!(factory.invalidate_connector(conn.id));
        assert!(!factory.invalidate_connector(conn.id));
        factory.get_connector(conn.id).await.unwrap();
        assert_eq!(provider.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_inactive_and_unsupported() {
        let (store, cipher) = setup();
        let factory = ConnectorFactory::new(store.clone(), cipher, system_clock())
            .with_provider(Arc::new(PaperProvider));

        let missing = factory.get_connector(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(RelayError::NotFound { .. })));

        let mut inactive = BrokerConnection::new("t1", BrokerType::Paper, vec![]);
        inactive.deactivate();
        BrokerConnectionRepository::add(store.as_ref(), &inactive).await.unwrap();
        let err = factory.get_connector(inactive.id).await;
        assert!(matches!(err, Err(RelayError::InactiveBrokerConnection(id)) if id == inactive.id));

        let ig = BrokerConnection::new("t1", BrokerType::Ig, vec![1, 2, 3]);
        BrokerConnectionRepository::add(store.as_ref(), &ig).await.unwrap();
        let err = factory.get_connector(ig.id).await;
        assert!(matches!(err, Err(RelayError::UnsupportedBrokerType(_))));
        assert_eq!(factory.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_equity_through_connector() {
        let (store, cipher) = setup();
        let mut conn = BrokerConnection::new("t1", BrokerType::Paper, vec![]);
        conn.metadata.insert("equity".into(), json!(5000));
        BrokerConnectionRepository::add(store.as_ref(), &conn).await.unwrap();

        let factory = Arc::new(
            ConnectorFactory::new(store, cipher, system_clock())
                .with_provider(Arc::new(PaperProvider)),
        );
        let equity = ConnectorEquity::new(factory);
        assert_eq!(equity.account_equity(conn.id).await.unwrap(), dec!(5000));
    }
}
