use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse free-text direction words used by signal channels
    pub fn from_word(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(Side::Buy),
            "sell" | "short" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Raw message surfaced by a feed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub tenant_id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub message_id: String,
    pub text: String,
    /// Time the message was posted on the feed, not when we saw it
    pub timestamp: DateTime<Utc>,
}

impl FeedMessage {
    /// `{tenant}:{channel}:{message}`
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.tenant_id, self.channel_id, self.message_id)
    }
}

/// Structured trading intent extracted from a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSignal {
    pub tenant_id: String,
    pub source: String,
    pub symbol: String,
    pub side: Side,
    /// Absent means market order
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// In the order they appear in the message
    pub take_profits: Vec<Decimal>,
    pub observed_at: DateTime<Utc>,
    pub raw_text: String,
    /// Correlation id and dedupe input
    pub hash: String,
}

impl NormalizedSignal {
    /// Hex SHA-256 over tenant, source, raw text and observation time
    pub fn compute_hash(
        tenant_id: &str,
        source: &str,
        raw_text: &str,
        observed_at: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(source.as_bytes());
        hasher.update(b"\n");
        hasher.update(raw_text.as_bytes());
        hasher.update(b"\n");
        hasher.update(
            observed_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }

    pub fn is_market_order(&self) -> bool {
        self.entry_price.is_none()
    }

    /// Working target: the first take-profit level
    pub fn primary_take_profit(&self) -> Option<Decimal> {
        self.take_profits.first().copied()
    }
}
