//! In-process message bus
//!
//! Five unbounded topics connect the feed sessions, the pipeline, the
//! execution layer and the control plane. Each topic is a competing-consumer
//! queue: any number of workers may call `recv`, and every message is handed
//! to exactly one of them in publish order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::domain::{
    AddChannelRequest, ConfigChange, FeedMessage, RemoveChannelRequest, TradeCommand,
};
use crate::error::{RelayError, Result};

/// Unbounded competing-consumer queue
pub struct Queue<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    published: Arc<AtomicU64>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            published: Arc::clone(&self.published),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + 'static> Queue<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn publish(&self, item: T) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|_| RelayError::Internal(format!("queue {} is closed", self.name)))?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait for the next item. Returns `None` only if every sender is gone,
    /// which cannot happen while this queue handle is alive.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Take an item if one is immediately available
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.try_recv() {
            items.push(item);
        }
        items
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// All topics the relay uses
#[derive(Debug, Clone)]
pub struct MessageBus {
    pub inbound: Queue<FeedMessage>,
    pub trade_commands: Queue<TradeCommand>,
    pub add_channel: Queue<AddChannelRequest>,
    pub remove_channel: Queue<RemoveChannelRequest>,
    pub config_changes: Queue<ConfigChange>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inbound: Queue::new("inbound-messages"),
            trade_commands: Queue::new("trade-commands"),
            add_channel: Queue::new("add-channel-requests"),
            remove_channel: Queue::new("remove-channel-requests"),
            config_changes: Queue::new("config-changes"),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue: Queue<u32> = Queue::new("numbers");
        for i in 0..5 {
            queue.publish(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.recv().await, Some(i));
        }
        assert_eq!(queue.published(), 5);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_debug_shows_name_and_published_count() {
        let bus = MessageBus::new();
        bus.trade_commands.publish(sample_command()).unwrap();
        let rendered = format!("{:?}", bus.trade_commands);
        assert!(rendered.contains("trade-commands"));
        assert!(rendered.contains("published: 1"));
    }

    fn sample_command() -> TradeCommand {
        TradeCommand {
            tenant_id: "t1".into(),
            symbol: "EURUSD".into(),
            side: crate::domain::Side::Buy,
            units: rust_decimal::Decimal::ONE,
            price: None,
            stop_loss: None,
            take_profit: None,
            correlation_id: "c1".into(),
            created_at: chrono::Utc::now(),
            broker_connection_id: uuid::Uuid::new_v4(),
            source_channel_id: None,
            max_slippage_pct: rust_decimal::Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn test_competing_consumers_each_item_once() {
        let queue: Queue<u32> = Queue::new("numbers");
        for i in 0..100 {
            queue.publish(i).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = q.try_recv() {
                    seen.push(item);
                    tokio::task::yield_now().await;
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
