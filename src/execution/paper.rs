//! Simulated broker that fills every order immediately.
//! Used for dry runs and for tenants that have not linked a live account.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::connector::{
    log_transition, BrokerConnector, ConnectorProvider, ExecutionReport, ExecutionState, SymbolMap,
};
use crate::credentials::BrokerCredentials;
use crate::domain::{BrokerConnection, BrokerType, TradeCommand};
use crate::error::Result;

const DEFAULT_EQUITY: Decimal = dec!(100000);

#[derive(Debug, Clone, Copy, Default)]
pub struct PaperProvider;

#[async_trait]
impl ConnectorProvider for PaperProvider {
    fn broker_type(&self) -> BrokerType {
        BrokerType::Paper
    }

    fn requires_credentials(&self) -> bool {
        false
    }

    async fn create(
        &self,
        connection: &BrokerConnection,
        _credentials: Option<BrokerCredentials>,
    ) -> Result<Arc<dyn BrokerConnector>> {
        Ok(Arc::new(PaperConnector::new(connection)))
    }
}

#[derive(Debug)]
pub struct PaperConnector {
    connection_id: Uuid,
    equity: Decimal,
    symbols: SymbolMap,
    fills: AtomicU64,
}

impl PaperConnector {
    /// Equity comes from `metadata.equity` (number or string), defaulting to 100000
    pub fn new(connection: &BrokerConnection) -> Self {
        let equity = connection
            .metadata
            .get("equity")
            .and_then(|v| match v {
                serde_json::Value::String(s) => Decimal::from_str(s).ok(),
                serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                _ => None,
            })
            .unwrap_or(DEFAULT_EQUITY);

        let mut symbols = SymbolMap::new();
        for (symbol, instrument) in connection.symbol_overrides() {
            symbols.insert(&symbol, &instrument);
        }

        Self {
            connection_id: connection.id,
            equity,
            symbols,
            fills: AtomicU64::new(0),
        }
    }

    pub fn fill_count(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerConnector for PaperConnector {
    fn broker_type(&self) -> BrokerType {
        BrokerType::Paper
    }

    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn validate_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, command: &TradeCommand) -> Result<ExecutionReport> {
        let correlation_id = command.correlation_id.as_str();
        let state = log_transition(
            self.connection_id,
            correlation_id,
            ExecutionState::BuildingRequest,
            ExecutionState::Submitted,
        );
        let state =
            log_transition(self.connection_id, correlation_id, state, ExecutionState::Accepted);

        let instrument = self
            .symbols
            .resolve(&command.symbol)
            .map(str::to_string)
            .unwrap_or_else(|_| command.symbol.clone());
        let deal_reference = format!("PAPER-{}", Uuid::new_v4().simple());
        self.fills.fetch_add(1, Ordering::Relaxed);

        info!(
            broker_connection = %self.connection_id,
            correlation_id,
            %instrument,
            side = %command.side,
            units = %command.units,
            price = ?command.price,
            %deal_reference,
            "[PAPER] order filled"
        );

        Ok(ExecutionReport {
            broker_connection_id: self.connection_id,
            correlation_id: command.correlation_id.clone(),
            instrument,
            deal_reference: deal_reference.clone(),
            deal_id: Some(deal_reference),
            fill_price: command.price,
            state,
        })
    }

    async fn account_equity(&self) -> Result<Decimal> {
        Ok(self.equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use serde_json::json;

    fn command() -> TradeCommand {
        TradeCommand {
            tenant_id: "t1".into(),
            symbol: "EURUSD".into(),
            side: Side::Sell,
            units: dec!(2),
            price: None,
            stop_loss: None,
            take_profit: None,
            correlation_id: "c1".into(),
            created_at: chrono::Utc::now(),
            broker_connection_id: Uuid::new_v4(),
            source_channel_id: None,
            max_slippage_pct: rust_decimal::Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn test_paper_fill() {
        let conn = BrokerConnection::new("t1", BrokerType::Paper, vec![]);
        let connector = PaperConnector::new(&conn);
        let report = connector.execute(&command()).await.unwrap();
        assert_eq!(report.state, ExecutionState::Accepted);
        assert_eq!(report.instrument, "EURUSD");
        assert!(report.deal_reference.starts_with("PAPER-"));
        assert_eq!(connector.fill_count(), 1);
        assert_eq!(connector.account_equity().await.unwrap(), dec!(100000));
    }

    #[tokio::test]
    async fn test_paper_equity_from_metadata() {
        let mut conn = BrokerConnection::new("t1", BrokerType::Paper, vec![]);
        conn.metadata.insert("equity".into(), json!("2500.50"));
        let connector = PaperConnector::new(&conn);
        assert_eq!(connector.account_equity().await.unwrap(), dec!(2500.50));

        conn.metadata.insert("equity".into(), json!(750));
        assert_eq!(PaperConnector::new(&conn).account_equity().await.unwrap(), dec!(750));
    }
}
