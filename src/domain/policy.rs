use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{RelayError, Result};

/// How position size is derived for each emitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingMode {
    /// Always trade the same number of units
    Fixed { units: Decimal },
    /// Trade a percentage of live account equity
    PercentOfEquity { percent: Decimal },
}

impl SizingMode {
    pub fn requires_equity(&self) -> bool {
        matches!(self, SizingMode::PercentOfEquity { .. })
    }
}

/// Daily UTC trading window, optionally limited to some weekdays.
///
/// `start > end` wraps midnight; the part after midnight belongs to the
/// session that opened the previous day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Empty means every day
    #[serde(default)]
    pub days: Vec<Weekday>,
}

impl TradingSession {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            days: Vec::new(),
        }
    }

    pub fn on_days(mut self, days: &[Weekday]) -> Self {
        self.days = days.to_vec();
        self
    }

    fn day_allowed(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let time = now.time();
        let day = now.weekday();

        if self.start == self.end {
            return self.day_allowed(day);
        }

        if self.start < self.end {
            return time >= self.start && time < self.end && self.day_allowed(day);
        }

        if time >= self.start {
            self.day_allowed(day)
        } else if time < self.end {
            self.day_allowed(day.pred())
        } else {
            false
        }
    }
}

/// Per-tenant risk policy. All admission and sizing rules live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPolicy {
    pub tenant_id: String,
    pub sizing: SizingMode,
    #[serde(default)]
    pub allowed_symbols: BTreeSet<String>,
    #[serde(default)]
    pub denied_symbols: BTreeSet<String>,
    /// Upper bound on equity committed per signal, in percent
    pub max_exposure_pct: Decimal,
    pub session: Option<TradingSession>,
    /// Maximum tolerated slippage, in percent of the entry price
    pub max_slippage_pct: Decimal,
    /// Off by default: signals are held for manual review
    #[serde(default)]
    pub auto_execute: bool,
    pub updated_at: DateTime<Utc>,
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

impl TradingPolicy {
    /// Conservative defaults: one unit, no session limit, auto-execute off
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            sizing: SizingMode::Fixed {
                units: Decimal::ONE,
            },
            allowed_symbols: BTreeSet::new(),
            denied_symbols: BTreeSet::new(),
            max_exposure_pct: Decimal::from(10),
            session: None,
            max_slippage_pct: Decimal::ZERO,
            auto_execute: false,
            updated_at: Utc::now(),
        }
    }

    pub fn set_sizing(&mut self, sizing: SizingMode) -> Result<()> {
        match sizing {
            SizingMode::Fixed { units } if units <= Decimal::ZERO => {
                return Err(RelayError::Validation(
                    "fixed sizing needs a positive unit count".into(),
                ));
            }
            SizingMode::PercentOfEquity { percent }
                if percent <= Decimal::ZERO || percent > Decimal::ONE_HUNDRED =>
            {
                return Err(RelayError::Validation(
                    "percent-of-equity sizing must be in (0, 100]".into(),
                ));
            }
            _ => {}
        }
        self.sizing = sizing;
        self.touch();
        Ok(())
    }

    pub fn set_max_exposure_pct(&mut self, pct: Decimal) -> Result<()> {
        if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
            return Err(RelayError::Validation(
                "max exposure must be in (0, 100]".into(),
            ));
        }
        self.max_exposure_pct = pct;
        self.touch();
        Ok(())
    }

    pub fn set_max_slippage_pct(&mut self, pct: Decimal) -> Result<()> {
        if pct < Decimal::ZERO {
            return Err(RelayError::Validation(
                "max slippage must not be negative".into(),
            ));
        }
        self.max_slippage_pct = pct;
        self.touch();
        Ok(())
    }

    pub fn set_session(&mut self, session: Option<TradingSession>) {
        self.session = session;
        self.touch();
    }

    pub fn set_auto_execute(&mut self, enabled: bool) {
        self.auto_execute = enabled;
        self.touch();
    }

    /// Admit a symbol; removes it from the deny-list.
    pub fn allow(&mut self, symbol: &str) {
        let symbol = normalize_symbol(symbol);
        self.denied_symbols.remove(&symbol);
        self.allowed_symbols.insert(symbol);
        self.touch();
    }

    /// Block a symbol; removes it from the allow-list.
    pub fn deny(&mut self, symbol: &str) {
        let symbol = normalize_symbol(symbol);
        self.allowed_symbols.remove(&symbol);
        self.denied_symbols.insert(symbol);
        self.touch();
    }

    /// Deny always wins; an empty allow-list admits everything not denied.
    pub fn is_admitted(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        if self.denied_symbols.contains(&symbol) {
            return false;
        }
        self.allowed_symbols.is_empty() || self.allowed_symbols.contains(&symbol)
    }

    pub fn is_within_session(&self, now: DateTime<Utc>) -> bool {
        self.session.as_ref().map_or(true, |s| s.contains(now))
    }

    /// Compute position size in units.
    ///
    /// Percent sizing needs both an entry price and the account equity; the
    /// requested percentage is capped at `max_exposure_pct`.
    pub fn position_size(
        &self,
        entry: Option<Decimal>,
        equity: Option<Decimal>,
    ) -> Result<Decimal> {
        let units = match self.sizing {
            SizingMode::Fixed { units } => units,
            SizingMode::PercentOfEquity { percent } => {
                let price = entry.filter(|p| *p > Decimal::ZERO).ok_or_else(|| {
                    RelayError::Validation(
                        "percent-of-equity sizing needs an entry price".into(),
                    )
                })?;
                let equity = equity.ok_or_else(|| {
                    RelayError::Validation("account equity unavailable".into())
                })?;
                let pct = percent.min(self.max_exposure_pct);
                (equity * pct / Decimal::ONE_HUNDRED / price)
                    .round_dp_with_strategy(2, RoundingStrategy::ToZero)
            }
        };

        if units <= Decimal::ZERO {
            return Err(RelayError::Validation(format!(
                "computed position size {} is not tradeable",
                units
            )));
        }
        Ok(units)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
