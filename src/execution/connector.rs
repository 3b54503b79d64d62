use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::coordination::poll_until;
use crate::credentials::BrokerCredentials;
use crate::domain::{BrokerConnection, BrokerType, TradeCommand};
use crate::error::{ExecutionError, Result};

/// Per-order execution state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    BuildingRequest,
    Submitted,
    PollingConfirmation,
    Accepted,
    Rejected,
    TimedOut,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::BuildingRequest => "building_request",
            ExecutionState::Submitted => "submitted",
            ExecutionState::PollingConfirmation => "polling_confirmation",
            ExecutionState::Accepted => "accepted",
            ExecutionState::Rejected => "rejected",
            ExecutionState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Accepted | ExecutionState::Rejected | ExecutionState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (BuildingRequest, Submitted)
                | (Submitted, PollingConfirmation)
                | (Submitted, Accepted)
                | (PollingConfirmation, Accepted)
                | (PollingConfirmation, Rejected)
                | (PollingConfirmation, TimedOut)
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of an accepted order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub broker_connection_id: Uuid,
    pub correlation_id: String,
    /// Broker-native instrument the order was placed on
    pub instrument: String,
    pub deal_reference: String,
    pub deal_id: Option<String>,
    pub fill_price: Option<Decimal>,
    pub state: ExecutionState,
}

/// Terminal status reported by a broker's confirmation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub status: DealStatus,
    pub deal_id: Option<String>,
    pub reason: Option<String>,
    pub level: Option<Decimal>,
}

/// Poll a deal reference to a terminal confirmation.
///
/// `fetch` returns `Ok(None)` while the broker has no answer yet. A
/// rejection and a missed deadline come back as distinct errors.
pub async fn await_confirmation<F, Fut>(
    deal_reference: &str,
    interval: Duration,
    deadline: Duration,
    fetch: F,
) -> Result<Confirmation>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<Confirmation>>>,
{
    let confirmation = poll_until(interval, deadline, fetch).await.map_err(|e| {
        ExecutionError::ConfirmationTimeout {
            deal_reference: deal_reference.to_string(),
            elapsed_ms: e.elapsed.as_millis() as u64,
        }
    })?;

    match confirmation.status {
        DealStatus::Accepted => Ok(confirmation),
        DealStatus::Rejected => Err(ExecutionError::Rejected {
            deal_reference: deal_reference.to_string(),
            reason: confirmation
                .reason
                .unwrap_or_else(|| "UNKNOWN".to_string()),
        }
        .into()),
    }
}

/// Standard symbol to broker instrument lookup
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: HashMap<String, String>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// IG CFD epics for the commonly signalled symbols
    pub fn ig_defaults() -> Self {
        let mut map = Self::new();
        for (symbol, epic) in [
            ("EURUSD", "CS.D.EURUSD.CFD.IP"),
            ("GBPUSD", "CS.D.GBPUSD.CFD.IP"),
            ("USDJPY", "CS.D.USDJPY.CFD.IP"),
            ("AUDUSD", "CS.D.AUDUSD.CFD.IP"),
            ("USDCAD", "CS.D.USDCAD.CFD.IP"),
            ("USDCHF", "CS.D.USDCHF.CFD.IP"),
            ("EURGBP", "CS.D.EURGBP.CFD.IP"),
            ("XAUUSD", "CS.D.CFDGOLD.CFDGC.IP"),
            ("XAGUSD", "CS.D.CFDSILVER.CFDSI.IP"),
        ] {
            map.insert(symbol, epic);
        }
        map
    }

    pub fn insert(&mut self, symbol: &str, instrument: &str) {
        self.entries
            .insert(symbol.to_ascii_uppercase(), instrument.to_string());
    }

    /// Apply per-connection overrides on top of the current entries
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (String, String)>) -> Self {
        for (symbol, instrument) in overrides {
            self.insert(&symbol, &instrument);
        }
        self
    }

    pub fn resolve(&self, symbol: &str) -> std::result::Result<&str, ExecutionError> {
        self.entries
            .get(&symbol.to_ascii_uppercase())
            .map(String::as_str)
            .ok_or_else(|| ExecutionError::UnmappedSymbol(symbol.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live, authenticated link to one broker account
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    fn broker_type(&self) -> BrokerType;

    fn connection_id(&self) -> Uuid;

    /// Broker-specific health check
    async fn validate_connection(&self) -> Result<()>;

    /// Submit an order and wait for its terminal confirmation
    async fn execute(&self, command: &TradeCommand) -> Result<ExecutionReport>;

    async fn account_equity(&self) -> Result<Decimal>;
}

/// Builds connectors for one broker type
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    fn broker_type(&self) -> BrokerType;

    /// Whether `create` needs decrypted credentials
    fn requires_credentials(&self) -> bool {
        true
    }

    async fn create(
        &self,
        connection: &BrokerConnection,
        credentials: Option<BrokerCredentials>,
    ) -> Result<Arc<dyn BrokerConnector>>;
}

pub(crate) fn log_transition(
    connection_id: Uuid,
    correlation_id: &str,
    from: ExecutionState,
    to: ExecutionState,
) -> ExecutionState {
    debug_assert!(from.can_transition_to(to), "{} -> {}", from, to);
    debug!(
        broker_connection = %connection_id,
        correlation_id,
        from = %from,
        to = %to,
        "order state"
    );
    to
}
