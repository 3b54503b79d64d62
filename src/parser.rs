//! Signal Parser
//!
//! Stateless text to structured-signal extraction, driven by the per-channel
//! pattern stored on `ChannelConfig`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{FeedMessage, NormalizedSignal, Side};
use crate::error::{RelayError, Result};

/// Pattern that understands the common "BUY #SYMBOL price SL x TP y" layout
pub const DEFAULT_SIGNAL_PATTERN: &str = r"(?is)\b(?P<side>buy|sell|long|short)\b\s*[#$]?(?P<symbol>[A-Z]{3,10}\d{0,3})(?:\s*(?:@|at|now)?\s*(?P<entry>\d+(?:\.\d+)?))?(?:.*?\bSL\s*[:=@]?\s*(?P<sl>\d+(?:\.\d+)?))?";

/// Take-profit levels: `TP 1.1`, `TP1: 1.1`, `tp2=1.2`
pub const DEFAULT_TAKE_PROFIT_PATTERN: &str =
    r"(?i)\bTP(?:\d+[\s:=@.)-]+|[\s:=@]*)(?P<tp>\d+(?:\.\d+)?)";

const REQUIRED_GROUPS: &[&str] = &["side", "symbol"];

/// Compiled extraction pattern for one channel
#[derive(Debug, Clone)]
pub struct ExtractionPattern {
    signal: Regex,
    take_profit: Regex,
}

impl ExtractionPattern {
    /// Compile and validate. The signal regex must name `side` and `symbol`;
    /// the take-profit regex must name `tp`.
    pub fn compile(signal: &str, take_profit: Option<&str>) -> Result<Self> {
        let signal_re = Regex::new(signal)
            .map_err(|e| RelayError::InvalidPattern(format!("signal pattern: {}", e)))?;
        let names: Vec<&str> = signal_re.capture_names().flatten().collect();
        for group in REQUIRED_GROUPS {
            if !names.contains(group) {
                return Err(RelayError::InvalidPattern(format!(
                    "signal pattern is missing the named group '{}'",
                    group
                )));
            }
        }

        let tp_source = take_profit.unwrap_or(DEFAULT_TAKE_PROFIT_PATTERN);
        let tp_re = Regex::new(tp_source)
            .map_err(|e| RelayError::InvalidPattern(format!("take-profit pattern: {}", e)))?;
        if !tp_re.capture_names().flatten().any(|n| n == "tp") {
            return Err(RelayError::InvalidPattern(
                "take-profit pattern is missing the named group 'tp'".into(),
            ));
        }

        Ok(Self {
            signal: signal_re,
            take_profit: tp_re,
        })
    }

    pub fn signal_source(&self) -> &str {
        self.signal.as_str()
    }
}

/// Fields pulled out of a message before tenant/source stamping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFields {
    pub side: Side,
    pub symbol: String,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profits: Vec<Decimal>,
}

impl ExtractedFields {
    pub fn into_signal(
        self,
        tenant_id: &str,
        source: &str,
        raw_text: &str,
        observed_at: DateTime<Utc>,
    ) -> NormalizedSignal {
        let hash = NormalizedSignal::compute_hash(tenant_id, source, raw_text, observed_at);
        NormalizedSignal {
            tenant_id: tenant_id.to_string(),
            source: source.to_string(),
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            take_profits: self.take_profits,
            observed_at,
            raw_text: raw_text.to_string(),
            hash,
        }
    }
}

fn normalize_symbol(raw: &str) -> String {
    raw.trim()
        .trim_start_matches(['#', '$'])
        .to_ascii_uppercase()
}

fn parse_price(raw: Option<regex::Match<'_>>) -> std::result::Result<Option<Decimal>, ()> {
    match raw {
        None => Ok(None),
        Some(m) => Decimal::from_str(m.as_str().trim())
            .map(Some)
            .map_err(|_| ()),
    }
}

/// Apply a pattern to text. `None` means the message is not a signal.
pub fn extract(pattern: &ExtractionPattern, text: &str) -> Option<ExtractedFields> {
    let caps = pattern.signal.captures(text)?;

    let side = Side::from_word(caps.name("side")?.as_str())?;
    let symbol = normalize_symbol(caps.name("symbol")?.as_str());
    if symbol.is_empty() {
        return None;
    }

    let entry_price = parse_price(caps.name("entry")).ok()?;
    let stop_loss = parse_price(caps.name("sl")).ok()?;

    let take_profits = pattern
        .take_profit
        .captures_iter(text)
        .filter_map(|c| c.name("tp"))
        .filter_map(|m| Decimal::from_str(m.as_str()).ok())
        .collect();

    Some(ExtractedFields {
        side,
        symbol,
        entry_price,
        stop_loss,
        take_profits,
    })
}

/// Parser with a cache of compiled channel patterns
#[derive(Debug, Clone, Default)]
pub struct SignalParser {
    compiled: Arc<DashMap<(String, Option<String>), Arc<ExtractionPattern>>>,
}

impl SignalParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn pattern(&self, signal: &str, take_profit: Option<&str>) -> Result<Arc<ExtractionPattern>> {
        let key = (signal.to_string(), take_profit.map(str::to_string));
        if let Some(found) = self.compiled.get(&key) {
            return Ok(Arc::clone(found.value()));
        }
        let compiled = Arc::new(ExtractionPattern::compile(signal, take_profit)?);
        self.compiled.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Parse a feed message with the given channel pattern, stamping the
    /// result with the tenant, the source label and the message's own timestamp.
    pub fn parse(
        &self,
        signal_pattern: &str,
        take_profit_pattern: Option<&str>,
        message: &FeedMessage,
        source: &str,
    ) -> Result<Option<NormalizedSignal>> {
        let pattern = self.pattern(signal_pattern, take_profit_pattern)?;
        let Some(fields) = extract(&pattern, &message.text) else {
            debug!(
                tenant = %message.tenant_id,
                channel = %message.channel_id,
                "message did not match channel pattern"
            );
            return Ok(None);
        };

        Ok(Some(fields.into_signal(
            &message.tenant_id,
            source,
            &message.text,
            message.timestamp,
        )))
    }

    /// Number of compiled patterns held
    pub fn cached_patterns(&self) -> usize {
        self.compiled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const GOLD_PATTERN: &str = r"(?i)(?P<side>buy|sell)\s+#?(?P<symbol>[A-Z0-9]+)\s+(?P<entry>\d+(?:\.\d+)?)?(?:.*?SL\s*(?P<sl>\d+(?:\.\d+)?))?";

    fn message(text: &str) -> FeedMessage {
        FeedMessage {
            tenant_id: "t1".into(),
            channel_id: "-100".into(),
            channel_name: Some("gold".into()),
            message_id: "1".into(),
            text: text.into(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn extracts_full_signal_with_ordered_take_profits() {
        let pattern = ExtractionPattern::compile(GOLD_PATTERN, None).unwrap();
        let fields = extract(&pattern, "Buy #XAUUSD 3750.5 SL 3740 TP 3753 TP 3760").unwrap();
        assert_eq!(fields.side, Side::Buy);
        assert_eq!(fields.symbol, "XAUUSD");
        assert_eq!(fields.entry_price, Some(dec!(3750.5)));
        assert_eq!(fields.stop_loss, Some(dec!(3740)));
        assert_eq!(fields.take_profits, vec![dec!(3753), dec!(3760)]);
    }

    #[test]
    fn numbered_take_profits() {
        let pattern = ExtractionPattern::compile(DEFAULT_SIGNAL_PATTERN, None).unwrap();
        let fields = extract(
            &pattern,
            "SELL EURUSD @ 1.0850\nSL: 1.0900\nTP1: 1.0800\nTP2 1.0750",
        )
        .unwrap();
        assert_eq!(fields.side, Side::Sell);
        assert_eq!(fields.symbol, "EURUSD");
        assert_eq!(fields.entry_price, Some(dec!(1.0850)));
        assert_eq!(fields.stop_loss, Some(dec!(1.0900)));
        assert_eq!(fields.take_profits, vec![dec!(1.0800), dec!(1.0750)]);
    }

    #[test]
    fn market_order_has_no_entry() {
        let pattern = ExtractionPattern::compile(DEFAULT_SIGNAL_PATTERN, None).unwrap();
        let fields = extract(&pattern, "long #BTCUSD now").unwrap();
        assert_eq!(fields.side, Side::Buy);
        assert_eq!(fields.symbol, "BTCUSD");
        assert_eq!(fields.entry_price, None);
        assert!(fields.take_profits.is_empty());
    }

    #[test]
    fn non_matching_text_is_none() {
        let pattern = ExtractionPattern::compile(GOLD_PATTERN, None).unwrap();
        assert!(extract(&pattern, "Good morning traders!").is_none());
    }

    #[test]
    fn compile_requires_named_groups() {
        assert!(ExtractionPattern::compile(r"(?P<side>buy)", None).is_err());
        assert!(ExtractionPattern::compile(GOLD_PATTERN, Some(r"TP (\d+)")).is_err());
        assert!(ExtractionPattern::compile(GOLD_PATTERN, Some(r"T(?P<tp>\d+)")).is_ok());
    }

    #[test]
    fn parse_stamps_tenant_source_and_original_timestamp() {
        let parser = SignalParser::new();
        let msg = message("Sell #XAUUSD 3700 SL 3710 TP 3690");
        let signal = parser
            .parse(GOLD_PATTERN, None, &msg, "channel:gold")
            .unwrap()
            .unwrap();

        assert_eq!(signal.tenant_id, "t1");
        assert_eq!(signal.source, "channel:gold");
        assert_eq!(signal.observed_at, msg.timestamp);
        assert_eq!(signal.raw_text, msg.text);
        assert_eq!(
            signal.hash,
            NormalizedSignal::compute_hash("t1", "channel:gold", &msg.text, msg.timestamp)
        );

        parser.parse(GOLD_PATTERN, None, &msg, "channel:gold").unwrap();
        assert_eq!(parser.cached_patterns(), 1);
    }
}
