//! Pipeline stages
//!
//! Each stage either hands its result to the next one or stops the message
//! with a [`Rejection`]. Store failures are errors, not rejections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::TenantConfigCache;
use crate::domain::{
    BrokerConnection, ChannelConfig, FeedMessage, NormalizedSignal, Tenant, TradeCommand,
    TradingPolicy,
};
use crate::error::Result;
use crate::idempotency::{ClaimOutcome, GuardedIdempotency};
use crate::parser::SignalParser;

/// Why a message stopped in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Duplicate,
    IdempotencyUnavailable,
    TenantNotFound,
    TenantInactive,
    ChannelUnknown,
    ChannelDisabled,
    NoMatch,
    PolicyMissing,
    SymbolNotAdmitted(String),
    OutsideSession,
    /// Auto-execute is off; the signal goes to manual review
    ManualReview,
    NoBrokers,
}

impl Rejection {
    /// Metric / log label
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Duplicate => "duplicate",
            Rejection::IdempotencyUnavailable => "idempotency_unavailable",
            Rejection::TenantNotFound => "tenant_not_found",
            Rejection::TenantInactive => "tenant_inactive",
            Rejection::ChannelUnknown => "channel_unknown",
            Rejection::ChannelDisabled => "channel_disabled",
            Rejection::NoMatch => "no_match",
            Rejection::PolicyMissing => "policy_missing",
            Rejection::SymbolNotAdmitted(_) => "symbol_not_admitted",
            Rejection::OutsideSession => "outside_session",
            Rejection::ManualReview => "manual_review",
            Rejection::NoBrokers => "no_brokers",
        }
    }

    /// Stops decided by the tenant's trading policy
    pub fn is_policy_stop(&self) -> bool {
        matches!(
            self,
            Rejection::SymbolNotAdmitted(_) | Rejection::OutsideSession | Rejection::ManualReview
        )
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::SymbolNotAdmitted(symbol) => write!(f, "symbol_not_admitted({})", symbol),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Stage result: continue with `T` or stop with a rejection
pub type Verdict<T> = std::result::Result<T, Rejection>;

/// Live account equity for percent-of-equity sizing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EquityProvider: Send + Sync {
    async fn account_equity(&self, broker_connection_id: Uuid) -> Result<Decimal>;
}

/// Stage 1: claim `{tenant}:{channel}:{message}`
pub async fn claim(
    idempotency: &GuardedIdempotency,
    message: &FeedMessage,
) -> Verdict<ClaimOutcome> {
    let outcome = idempotency.claim(&message.idempotency_key()).await;
    match outcome {
        ClaimOutcome::Claimed | ClaimOutcome::AllowedUnverified => Ok(outcome),
        ClaimOutcome::Duplicate => Err(Rejection::Duplicate),
        ClaimOutcome::RejectedUnverified => Err(Rejection::IdempotencyUnavailable),
    }
}

/// Stage 2: tenant must exist and be active
pub async fn resolve_tenant(cache: &TenantConfigCache, tenant_id: &str) -> Result<Verdict<Tenant>> {
    Ok(match cache.tenant(tenant_id).await? {
        None => Err(Rejection::TenantNotFound),
        Some(tenant) if !tenant.is_active() => Err(Rejection::TenantInactive),
        Some(tenant) => Ok(tenant),
    })
}

/// Stage 3: channel config must exist and be enabled
pub async fn resolve_channel(
    cache: &TenantConfigCache,
    tenant_id: &str,
    channel_id: &str,
) -> Result<Verdict<ChannelConfig>> {
    Ok(match cache.channel(tenant_id, channel_id).await? {
        None => Err(Rejection::ChannelUnknown),
        Some(config) if !config.enabled => Err(Rejection::ChannelDisabled),
        Some(config) => Ok(config),
    })
}

/// Stage 4: apply the channel pattern to the message text
pub fn parse(
    parser: &SignalParser,
    channel: &ChannelConfig,
    message: &FeedMessage,
) -> Result<Verdict<NormalizedSignal>> {
    let parsed = parser.parse(
        &channel.pattern,
        channel.take_profit_pattern.as_deref(),
        message,
        &channel.source_label(),
    )?;
    Ok(parsed.ok_or(Rejection::NoMatch))
}

/// Stage 5: the tenant must have a trading policy
pub async fn resolve_policy(
    cache: &TenantConfigCache,
    tenant_id: &str,
) -> Result<Verdict<TradingPolicy>> {
    Ok(cache.policy(tenant_id).await?.ok_or(Rejection::PolicyMissing))
}

/// Stage 6: symbol admission, session window, auto-execute
pub fn validate_risk(
    policy: &TradingPolicy,
    signal: &NormalizedSignal,
    now: DateTime<Utc>,
) -> Verdict<()> {
    if !policy.is_admitted(&signal.symbol) {
        return Err(Rejection::SymbolNotAdmitted(signal.symbol.clone()));
    }
    if !policy.is_within_session(now) {
        return Err(Rejection::OutsideSession);
    }
    if !policy.auto_execute {
        return Err(Rejection::ManualReview);
    }
    Ok(())
}

/// Stage 7: explicit channel routing, or every active broker of the tenant.
///
/// Explicit ids are kept in channel order and limited to active connections.
pub async fn resolve_brokers(
    cache: &TenantConfigCache,
    channel: &ChannelConfig,
) -> Result<Verdict<Vec<BrokerConnection>>> {
    let active = cache.active_brokers(&channel.tenant_id).await?;

    let targets: Vec<BrokerConnection> = if channel.broker_connection_ids.is_empty() {
        active
    } else {
        let mut seen = HashSet::new();
        channel
            .broker_connection_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| {
                let found = active.iter().find(|b| b.id == *id).cloned();
                if found.is_none() {
                    warn!(
                        tenant = %channel.tenant_id,
                        channel = %channel.channel_id,
                        broker_connection = %id,
                        "routed broker connection is missing or inactive"
                    );
                }
                found
            })
            .collect()
    };

    if targets.is_empty() {
        return Ok(Err(Rejection::NoBrokers));
    }
    Ok(Ok(targets))
}

/// Stage 8: size the order for each broker and build one command per target.
///
/// Targets that cannot be sized are skipped with a warning.
pub async fn build_commands(
    policy: &TradingPolicy,
    signal: &NormalizedSignal,
    brokers: &[BrokerConnection],
    equity: &dyn EquityProvider,
    source_channel_id: &str,
    now: DateTime<Utc>,
) -> Vec<TradeCommand> {
    let mut commands = Vec::with_capacity(brokers.len());

    for broker in brokers {
        let account_equity = if policy.sizing.requires_equity() {
            if signal.is_market_order() {
                warn!(
                    correlation_id = %signal.hash,
                    broker_connection = %broker.id,
                    "percent-of-equity sizing needs an entry price, skipping broker"
                );
                continue;
            }
            match equity.account_equity(broker.id).await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(
                        correlation_id = %signal.hash,
                        broker_connection = %broker.id,
                        error = %e,
                        "account equity lookup failed, skipping broker"
                    );
                    continue;
                }
            }
        } else {
            None
        };

        let units = match policy.position_size(signal.entry_price, account_equity) {
            Ok(units) => units,
            Err(e) => {
                warn!(
                    correlation_id = %signal.hash,
                    broker_connection = %broker.id,
                    error = %e,
                    "position sizing failed, skipping broker"
                );
                continue;
            }
        };

        debug!(
            correlation_id = %signal.hash,
            broker_connection = %broker.id,
            %units,
            "order sized"
        );
        commands.push(
            TradeCommand::from_signal(signal, broker.id, units, Some(source_channel_id), now)
                .with_max_slippage(policy.max_slippage_pct),
        );
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BrokerType, SizingMode};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn signal(entry: Option<Decimal>) -> NormalizedSignal {
        let observed = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let text = "Buy #XAUUSD 3750.5 SL 3740 TP 3753 TP 3760";
        NormalizedSignal {
            tenant_id: "t1".into(),
            source: "channel:gold".into(),
            symbol: "XAUUSD".into(),
            side: crate::domain::Side::Buy,
            entry_price: entry,
            stop_loss: Some(dec!(3740)),
            take_profits: vec![dec!(3753), dec!(3760)],
            observed_at: observed,
            raw_text: text.into(),
            hash: NormalizedSignal::compute_hash("t1", "channel:gold", text, observed),
        }
    }

    fn brokers(n: usize) -> Vec<BrokerConnection> {
        (0..n)
            .map(|_| BrokerConnection::new("t1", BrokerType::Paper, Vec::new()))
            .collect()
    }

    fn auto_policy() -> TradingPolicy {
        let mut policy = TradingPolicy::new("t1");
        policy.set_auto_execute(true);
        policy
    }

    #[test]
    fn test_risk_deny_wins_over_allow() {
        let mut policy = auto_policy();
        policy.allow("XAUUSD");
        policy.deny("XAUUSD");
        let now = Utc::now();
        assert_eq!(
            validate_risk(&policy, &signal(None), now),
            Err(Rejection::SymbolNotAdmitted("XAUUSD".into()))
        );
    }

    #[test]
    fn test_risk_auto_execute_off_is_manual_review() {
        let policy = TradingPolicy::new("t1");
        let verdict = validate_risk(&policy, &signal(None), Utc::now());
        assert_eq!(verdict, Err(Rejection::ManualReview));
        assert!(Rejection::ManualReview.is_policy_stop());
        assert!(!Rejection::Duplicate.is_policy_stop());
    }

    #[tokio::test]
    async fn test_fixed_sizing_never_asks_for_equity() {
        let mut equity = MockEquityProvider::new();
        equity.expect_account_equity().never();

        let policy = auto_policy();
        let targets = brokers(3);
        let commands =
            build_commands(&policy, &signal(None), &targets, &equity, "-100", Utc::now()).await;

        assert_eq!(commands.len(), 3);
        assert!(commands.iter().all(|c| c.units == dec!(1)));
        assert!(commands.iter().all(|c| c.correlation_id == commands[0].correlation_id));
    }

    #[tokio::test]
    async fn test_percent_sizing_uses_equity_and_caps_exposure() {
        let mut equity = MockEquityProvider::new();
        equity
            .expect_account_equity()
            .times(1)
            .returning(|_| Ok(dec!(100000)));

        let mut policy = auto_policy();
        policy
            .set_sizing(SizingMode::PercentOfEquity { percent: dec!(50) })
            .unwrap();
        let entry = signal(Some(dec!(2000)));
        let commands =
            build_commands(&policy, &entry, &brokers(1), &equity, "-100", Utc::now()).await;

        // 100000 * min(50, 10) / 100 / 2000
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].units, dec!(5));
        assert_eq!(commands[0].take_profit, Some(dec!(3753)));
    }

    #[tokio::test]
    async fn test_commands_carry_policy_slippage() {
        let mut equity = MockEquityProvider::new();
        equity.expect_account_equity().never();

        let mut policy = auto_policy();
        policy.set_max_slippage_pct(dec!(0.2)).unwrap();
        let entry = signal(Some(dec!(2000)));
        let commands =
            build_commands(&policy, &entry, &brokers(2), &equity, "-100", Utc::now()).await;

        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.max_slippage_pct == dec!(0.2)));
        assert_eq!(commands[0].worst_fill_price(), Some(dec!(2004)));
    }

    #[tokio::test]
    async fn test_percent_sizing_skips_market_orders() {
        let mut equity = MockEquityProvider::new();
        equity.expect_account_equity().never();

        let mut policy = auto_policy();
        policy
            .set_sizing(SizingMode::PercentOfEquity { percent: dec!(2) })
            .unwrap();
        let commands =
            build_commands(&policy, &signal(None), &brokers(2), &equity, "-100", Utc::now()).await;
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn test_equity_failure_skips_only_that_broker() {
        let targets = brokers(2);
        let failing = targets[0].id;

        let mut equity = MockEquityProvider::new();
        equity.expect_account_equity().returning(move |id| {
            if id == failing {
                Err(crate::error::RelayError::Timeout("equity".into()))
            } else {
                Ok(dec!(10000))
            }
        });

        let mut policy = auto_policy();
        policy
            .set_sizing(SizingMode::PercentOfEquity { percent: dec!(10) })
            .unwrap();
        let entry = signal(Some(dec!(100)));
        let commands =
            build_commands(&policy, &entry, &targets, &equity, "-100", Utc::now()).await;

        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].broker_connection_id, targets[1].id);
        assert_eq!(commands[0].units, dec!(10));
    }
}
