use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for observability
#[derive(Debug, Default)]
pub struct Metrics {
    /// Inbound feed messages taken off the queue
    pub messages_received: AtomicU64,
    /// Messages dropped by the idempotency claim
    pub duplicates: AtomicU64,
    /// Signals parked for manual review
    pub manual_reviews: AtomicU64,
    /// Trade commands published
    pub commands_emitted: AtomicU64,
    /// Messages whose processing raised an error
    pub pipeline_errors: AtomicU64,
    /// Orders confirmed by the broker
    pub orders_accepted: AtomicU64,
    /// Orders declined by the broker
    pub orders_rejected: AtomicU64,
    /// Orders with no confirmation before the deadline
    pub orders_timed_out: AtomicU64,
    /// Orders that could not be submitted at all
    pub orders_failed: AtomicU64,
    /// Feed sessions created by the pool
    pub sessions_created: AtomicU64,
    /// Feed sessions removed as unhealthy
    pub sessions_evicted: AtomicU64,
    /// Pipeline drops by rejection reason
    drops: DashMap<&'static str, u64>,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Count a pipeline drop under its reason label
    pub fn record_drop(&self, reason: &'static str) {
        *self.drops.entry(reason).or_insert(0) += 1;
    }

    pub fn drops(&self, reason: &str) -> u64 {
        self.drops.get(reason).map(|v| *v).unwrap_or(0)
    }

    /// Prometheus text exposition
    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 11] = [
            (
                "relay_messages_received_total",
                "Inbound feed messages processed",
                &self.messages_received,
            ),
            ("relay_duplicates_total", "Messages dropped as duplicates", &self.duplicates),
            (
                "relay_manual_reviews_total",
                "Signals recorded for manual review",
                &self.manual_reviews,
            ),
            ("relay_commands_emitted_total", "Trade commands published", &self.commands_emitted),
            (
                "relay_pipeline_errors_total",
                "Messages whose processing failed",
                &self.pipeline_errors,
            ),
            ("relay_orders_accepted_total", "Orders accepted by a broker", &self.orders_accepted),
            ("relay_orders_rejected_total", "Orders rejected by a broker", &self.orders_rejected),
            (
                "relay_orders_timed_out_total",
                "Orders without confirmation before the deadline",
                &self.orders_timed_out,
            ),
            (
                "relay_orders_failed_total",
                "Orders that could not be submitted",
                &self.orders_failed,
            ),
            ("relay_sessions_created_total", "Feed sessions created", &self.sessions_created),
            (
                "relay_sessions_evicted_total",
                "Unhealthy feed sessions evicted",
                &self.sessions_evicted,
            ),
        ];

        let mut out = String::new();
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, Self::get(counter));
        }

        let _ = writeln!(out, "# HELP relay_pipeline_drops_total Pipeline drops by reason");
        let _ = writeln!(out, "# TYPE relay_pipeline_drops_total counter");
        let mut drops: Vec<(&'static str, u64)> =
            self.drops.iter().map(|e| (*e.key(), *e.value())).collect();
        drops.sort_unstable();
        for (reason, count) in drops {
            let _ = writeln!(out, "relay_pipeline_drops_total{{reason=\"{}\"}} {}", reason, count);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = Metrics::new();
        Metrics::inc(&metrics.messages_received);
        Metrics::inc(&metrics.messages_received);
        metrics.record_drop("channel_disabled");

        assert_eq!(Metrics::get(&metrics.messages_received), 2);
        assert_eq!(metrics.drops("channel_disabled"), 1);
        assert_eq!(metrics.drops("no_match"), 0);

        let text = metrics.render_prometheus();
        assert!(text.contains("relay_messages_received_total 2"));
        assert!(text.contains("relay_pipeline_drops_total{reason=\"channel_disabled\"} 1"));
    }
}
