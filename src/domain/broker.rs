use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerType {
    /// IG Markets REST trading API
    Ig,
    /// In-process simulated broker
    Paper,
}

impl BrokerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ig => "ig",
            Self::Paper => "paper",
        }
    }
}

impl fmt::Display for BrokerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerType {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ig" | "ig_markets" => Ok(Self::Ig),
            "paper" | "dry_run" => Ok(Self::Paper),
            other => Err(RelayError::UnsupportedBrokerType(other.to_string())),
        }
    }
}

/// A tenant's connection to one broker account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConnection {
    pub id: Uuid,
    pub tenant_id: String,
    pub broker_type: BrokerType,
    /// Encrypted credential blob
    pub credentials: Vec<u8>,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Free-form broker metadata, e.g. `{"symbols": {"XAUUSD": "CS.D.CFDGOLD.CFDGC.IP"}}`
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl BrokerConnection {
    pub fn new(tenant_id: &str, broker_type: BrokerType, credentials: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            broker_type,
            credentials,
            active: true,
            last_used_at: None,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn mark_used(&mut self, at: DateTime<Utc>) {
        self.last_used_at = Some(at);
    }

    /// Symbol overrides stored under `metadata.symbols`
    pub fn symbol_overrides(&self) -> Vec<(String, String)> {
        self.metadata
            .get("symbols")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| {
                        v.as_str().map(|s| (k.to_ascii_uppercase(), s.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
