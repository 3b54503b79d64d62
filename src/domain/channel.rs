use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::parser::ExtractionPattern;

/// Per-(tenant, external channel) extraction and routing config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: Uuid,
    pub tenant_id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
    /// Signal regex with named groups `side`, `symbol`, `entry`, `sl`
    pub pattern: String,
    /// Optional override for the take-profit level regex (named group `tp`)
    pub take_profit_pattern: Option<String>,
    pub enabled: bool,
    /// Explicit broker connections to route to; empty means all active ones
    #[serde(default)]
    pub broker_connection_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelConfig {
    /// Create an enabled config. The pattern must compile.
    pub fn new(tenant_id: &str, channel_id: &str, pattern: &str) -> Result<Self> {
        if tenant_id.trim().is_empty() || channel_id.trim().is_empty() {
            return Err(RelayError::Validation(
                "channel config needs a tenant id and a channel id".into(),
            ));
        }
        ExtractionPattern::compile(pattern, None)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            channel_id: channel_id.to_string(),
            channel_name: None,
            pattern: pattern.to_string(),
            take_profit_pattern: None,
            enabled: true,
            broker_connection_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.channel_name = Some(name.to_string());
        self
    }

    pub fn with_brokers(mut self, ids: Vec<Uuid>) -> Self {
        self.broker_connection_ids = ids;
        self
    }

    /// Replace the extraction patterns, validating both before applying.
    pub fn update_pattern(&mut self, pattern: &str, take_profit: Option<&str>) -> Result<()> {
        ExtractionPattern::compile(pattern, take_profit)?;
        self.pattern = pattern.to_string();
        self.take_profit_pattern = take_profit.map(str::to_string);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Compile the stored patterns for the parser
    pub fn extraction_pattern(&self) -> Result<ExtractionPattern> {
        ExtractionPattern::compile(&self.pattern, self.take_profit_pattern.as_deref())
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.updated_at = Utc::now();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.updated_at = Utc::now();
    }

    /// Label used as `NormalizedSignal::source`
    pub fn source_label(&self) -> String {
        format!(
            "channel:{}",
            self.channel_name.as_deref().unwrap_or(&self.channel_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: &str = r"(?i)(?P<side>buy|sell)\s+#?(?P<symbol>[A-Z]+)";

    #[test]
    fn invalid_pattern_is_rejected_at_creation() {
        assert!(matches!(
            ChannelConfig::new("t1", "c1", "(unclosed"),
            Err(RelayError::InvalidPattern(_))
        ));
    }

    #[test]
    fn invalid_pattern_is_rejected_on_update_and_keeps_old_value() {
        let mut config = ChannelConfig::new("t1", "c1", PATTERN).unwrap();
        assert!(config.update_pattern("[", None).is_err());
        assert_eq!(config.pattern, PATTERN);
        assert!(config
            .update_pattern(PATTERN, Some(r"TP\s*(?P<tp>\d+"))
            .is_err());
        assert!(config.take_profit_pattern.is_none());
    }

    #[test]
    fn source_label_prefers_channel_name() {
        let config = ChannelConfig::new("t1", "-100123", PATTERN).unwrap();
        assert_eq!(config.source_label(), "channel:-100123");
        assert_eq!(config.with_name("gold").source_label(), "channel:gold");
    }
}
