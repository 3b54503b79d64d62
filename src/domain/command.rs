use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::signal::{NormalizedSignal, Side};

/// Order instruction for one broker connection, emitted by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeCommand {
    pub tenant_id: String,
    pub symbol: String,
    pub side: Side,
    pub units: Decimal,
    /// Absent means market order
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Equal to the originating signal hash
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub broker_connection_id: Uuid,
    pub source_channel_id: Option<String>,
    /// Tolerated move against a limit entry, in percent
    #[serde(default)]
    pub max_slippage_pct: Decimal,
}

impl TradeCommand {
    pub fn from_signal(
        signal: &NormalizedSignal,
        broker_connection_id: Uuid,
        units: Decimal,
        source_channel_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: signal.tenant_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            units,
            price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.primary_take_profit(),
            correlation_id: signal.hash.clone(),
            created_at,
            broker_connection_id,
            source_channel_id: source_channel_id.map(str::to_string),
            max_slippage_pct: Decimal::ZERO,
        }
    }

    pub fn with_max_slippage(mut self, pct: Decimal) -> Self {
        self.max_slippage_pct = pct;
        self
    }

    pub fn is_market_order(&self) -> bool {
        self.price.is_none()
    }

    /// Worst acceptable fill for a limit order: the entry moved against the
    /// trade by the slippage tolerance, rounded to at least 2 dp.
    pub fn worst_fill_price(&self) -> Option<Decimal> {
        let price = self.price?;
        let tolerance = price * self.max_slippage_pct / Decimal::ONE_HUNDRED;
        let level = match self.side {
            Side::Buy => price + tolerance,
            Side::Sell => price - tolerance,
        };
        Some(level.round_dp(price.scale().max(2)))
    }
}

/// Control request: start observing a channel for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddChannelRequest {
    pub tenant_id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
}

/// Control request: stop observing a channel for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveChannelRequest {
    pub tenant_id: String,
    pub channel_id: String,
}

/// Notification that tenant configuration changed outside this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ConfigChange {
    Tenant { tenant_id: String },
    Channel { tenant_id: String, channel_id: String },
    Policy { tenant_id: String },
    BrokerConnection { tenant_id: String, connection_id: Uuid },
}

impl ConfigChange {
    pub fn tenant_id(&self) -> &str {
        match self {
            ConfigChange::Tenant { tenant_id }
            | ConfigChange::Channel { tenant_id, .. }
            | ConfigChange::Policy { tenant_id }
            | ConfigChange::BrokerConnection { tenant_id, .. } => tenant_id,
        }
    }
}
