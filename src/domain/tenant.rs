use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayError, Result};

/// Tenant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Suspended => "suspended",
        }
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: TenantStatus) -> bool {
        use TenantStatus::*;

        match (self, target) {
            (Inactive, Active) => true,
            (Active, Inactive) => true,
            (Active, Suspended) => true,
            (Suspended, Active) => true,
            (Suspended, Inactive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TenantStatus {
    type Error = RelayError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            "suspended" => Ok(TenantStatus::Suspended),
            other => Err(RelayError::Validation(format!(
                "unknown tenant status '{}'",
                other
            ))),
        }
    }
}

/// Subscription tier, carried for the billing collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }
}

impl TryFrom<&str> for SubscriptionTier {
    type Error = RelayError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "basic" => Ok(SubscriptionTier::Basic),
            "pro" => Ok(SubscriptionTier::Pro),
            "enterprise" => Ok(SubscriptionTier::Enterprise),
            other => Err(RelayError::Validation(format!(
                "unknown subscription tier '{}'",
                other
            ))),
        }
    }
}

/// A customer account owning channels, policy, and broker connections.
///
/// Channel configs are separate entities; the tenant only keeps the ids of the
/// channels it observes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub email: String,
    pub status: TenantStatus,
    pub tier: SubscriptionTier,
    /// Encrypted feed credentials blob, only decrypted in memory
    #[serde(default)]
    pub feed_credentials: Vec<u8>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create a new active tenant
    pub fn new(id: &str, email: &str, tier: SubscriptionTier) -> Result<Self> {
        let id = id.trim();
        let email = email.trim();
        if id.is_empty() {
            return Err(RelayError::Validation("tenant id must not be empty".into()));
        }
        if email.is_empty() {
            return Err(RelayError::Validation(
                "tenant email must not be empty".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            email: email.to_string(),
            status: TenantStatus::Active,
            tier,
            feed_credentials: Vec::new(),
            channel_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_feed_credentials(mut self, blob: Vec<u8>) -> Self {
        self.feed_credentials = blob;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn activate(&mut self) -> Result<()> {
        self.transition(TenantStatus::Active)
    }

    pub fn deactivate(&mut self) -> Result<()> {
        self.transition(TenantStatus::Inactive)
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.transition(TenantStatus::Suspended)
    }

    fn transition(&mut self, target: TenantStatus) -> Result<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(RelayError::Validation(format!(
                "tenant {} cannot move from {} to {}",
                self.id, self.status, target
            )));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Add a channel to the subscription list. Returns false if already present.
    pub fn subscribe_channel(&mut self, channel_id: &str) -> Result<bool> {
        self.require_active("subscribe to a channel")?;
        if self.channel_ids.iter().any(|c| c == channel_id) {
            return Ok(false);
        }
        self.channel_ids.push(channel_id.to_string());
        self.updated_at = Utc::now();
        Ok(true)
    }

    /// Remove a channel from the subscription list. Returns false if absent.
    pub fn unsubscribe_channel(&mut self, channel_id: &str) -> Result<bool> {
        self.require_active("unsubscribe from a channel")?;
        let before = self.channel_ids.len();
        self.channel_ids.retain(|c| c != channel_id);
        let removed = self.channel_ids.len() != before;
        if removed {
            self.updated_at = Utc::now();
        }
        Ok(removed)
    }

    fn require_active(&self, action: &str) -> Result<()> {
        if !self.is_active() {
            return Err(RelayError::Validation(format!(
                "tenant {} is {} and cannot {}",
                self.id, self.status, action
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_identity() {
        assert!(Tenant::new("", "a@b.c", SubscriptionTier::Free).is_err());
        assert!(Tenant::new("t1", "  ", SubscriptionTier::Free).is_err());
        assert!(Tenant::new("t1", "a@b.c", SubscriptionTier::Pro).is_ok());
    }

    #[test]
    fn channel_mutation_requires_active_status() {
        let mut tenant = Tenant::new("t1", "a@b.c", SubscriptionTier::Basic).unwrap();
        assert!(tenant.subscribe_channel("100").unwrap());
        assert!(!tenant.subscribe_channel("100").unwrap());

        tenant.suspend().unwrap();
        assert!(tenant.subscribe_channel("200").is_err());
        assert!(tenant.unsubscribe_channel("100").is_err());

        tenant.activate().unwrap();
        assert!(tenant.unsubscribe_channel("100").unwrap());
        assert!(!tenant.unsubscribe_channel("100").unwrap());
    }

    #[test]
    fn status_transitions_are_checked() {
        assert!(TenantStatus::Active.can_transition_to(TenantStatus::Suspended));
        assert!(!TenantStatus::Inactive.can_transition_to(TenantStatus::Suspended));

        let mut tenant = Tenant::new("t1", "a@b.c", SubscriptionTier::Free).unwrap();
        tenant.deactivate().unwrap();
        assert!(tenant.suspend().is_err());
    }
}
