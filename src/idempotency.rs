//! Idempotency claims
//!
//! First-writer-wins markers that turn at-least-once delivery into
//! at-most-once processing. Backends implement [`IdempotencyStore`];
//! [`GuardedIdempotency`] decides what happens when the backend is down.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::coordination::SharedClock;
use crate::error::Result;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `key`. True only for the first caller within `ttl`.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn is_claimed(&self, key: &str) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}

/// Process-local claims with expiry
#[derive(Debug)]
pub struct MemoryIdempotencyStore {
    claims: DashMap<String, Instant>,
    clock: SharedClock,
}

impl MemoryIdempotencyStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            claims: DashMap::new(),
            clock,
        }
    }

    /// Drop expired claims. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.claims.len();
        self.claims.retain(|_, expires_at| *expires_at > now);
        before - self.claims.len()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let claimed = match self.claims.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() > now {
                    false
                } else {
                    existing.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                true
            }
        };
        Ok(claimed)
    }

    async fn is_claimed(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .claims
            .get(key)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false))
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.claims.remove(key);
        Ok(())
    }
}

/// What to do when the claim backend cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Process the message anyway (duplicate risk over pipeline stall)
    #[default]
    Allow,
    /// Drop the message
    Reject,
}

/// Outcome of a guarded claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate,
    /// Backend unreachable, allowed through by policy
    AllowedUnverified,
    /// Backend unreachable, rejected by policy
    RejectedUnverified,
}

impl ClaimOutcome {
    pub fn proceed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed | ClaimOutcome::AllowedUnverified)
    }
}

/// Claim store plus the failure policy and TTL the pipeline uses
#[derive(Clone)]
pub struct GuardedIdempotency {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    on_unavailable: UnavailablePolicy,
}

impl GuardedIdempotency {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        ttl: Duration,
        on_unavailable: UnavailablePolicy,
    ) -> Self {
        Self {
            store,
            ttl,
            on_unavailable,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn claim(&self, key: &str) -> ClaimOutcome {
        match self.store.try_claim(key, self.ttl).await {
            Ok(true) => ClaimOutcome::Claimed,
            Ok(false) => {
                debug!(key, "idempotency claim already held");
                ClaimOutcome::Duplicate
            }
            Err(e) => match self.on_unavailable {
                UnavailablePolicy::Allow => {
                    warn!(key, error = %e, "idempotency store unavailable, processing unverified");
                    ClaimOutcome::AllowedUnverified
                }
                UnavailablePolicy::Reject => {
                    warn!(key, error = %e, "idempotency store unavailable, dropping message");
                    ClaimOutcome::RejectedUnverified
                }
            },
        }
    }

    pub async fn is_claimed(&self, key: &str) -> Result<bool> {
        self.store.is_claimed(key).await
    }

    pub async fn release(&self, key: &str) -> Result<()> {
        self.store.release(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ManualClock;
    use crate::error::RelayError;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    struct DownStore;

    #[async_trait]
    impl IdempotencyStore for DownStore {
        async fn try_claim(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Err(RelayError::Timeout("store unreachable".into()))
        }
        async fn is_claimed(&self, _key: &str) -> Result<bool> {
            Err(RelayError::Timeout("store unreachable".into()))
        }
        async fn release(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let store = MemoryIdempotencyStore::new(Arc::new(ManualClock::new()));
        assert!(store.try_claim("t:c:1", DAY).await.unwrap());
        assert!(!store.try_claim("t:c:1", DAY).await.unwrap());
        assert!(store.is_claimed("t:c:1").await.unwrap());
        assert!(!store.is_claimed("t:c:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_exactly_one_wins() {
        let store = Arc::new(MemoryIdempotencyStore::new(Arc::new(ManualClock::new())));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.try_claim("k", DAY).await.unwrap() }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_claim_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryIdempotencyStore::new(clock.clone());
        assert!(store.try_claim("k", DAY).await.unwrap());

        clock.advance(DAY);
        assert!(!store.is_claimed("k").await.unwrap());
        assert!(store.try_claim("k", DAY).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_and_purge() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryIdempotencyStore::new(clock.clone());
        store.try_claim("a", Duration::from_secs(1)).await.unwrap();
        store.try_claim("b", DAY).await.unwrap();

        store.release("b").await.unwrap();
        assert!(store.try_claim("b", DAY).await.unwrap());

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_open_by_default() {
        let guarded =
            GuardedIdempotency::new(Arc::new(DownStore), DAY, UnavailablePolicy::default());
        let outcome = guarded.claim("k").await;
        assert_eq!(outcome, ClaimOutcome::AllowedUnverified);
        assert!(outcome.proceed());
    }

    #[tokio::test]
    async fn test_unavailable_store_can_fail_closed() {
        let guarded = GuardedIdempotency::new(Arc::new(DownStore), DAY, UnavailablePolicy::Reject);
        assert!(!guarded.claim("k").await.proceed());
    }
}
