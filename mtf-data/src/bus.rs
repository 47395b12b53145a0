use crate::bar::{Bar1m, Tick};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Default per-topic channel capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 1_024;

/// Notifications published by the upstream bar builder.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A 1-minute bar closed.
    BarClosed(Bar1m),
    /// A previously closed 1-minute bar was corrected.
    BarCorrected(Bar1m),
    /// In-progress snapshot of the open 1-minute bar.
    Partial(Bar1m),
    Tick(Tick),
}

impl BusEvent {
    pub fn symbol(&self) -> &SmolStr {
        match self {
            BusEvent::BarClosed(bar) | BusEvent::BarCorrected(bar) | BusEvent::Partial(bar) => {
                &bar.symbol
            }
            BusEvent::Tick(tick) => &tick.symbol,
        }
    }
}

/// In-process publish/subscribe bus with one typed topic per symbol plus a firehose topic.
///
/// Per-symbol topics are created lazily on first subscribe. Topic and firehose subscribers are
/// advisory: one that falls more than `capacity` events behind loses the oldest ones.
///
/// Reliable subscribers see every event in publish order. Each has a bounded queue and
/// [`EventBus::publish`] waits for room in it, so a slow reliable subscriber slows publishers
/// down instead of losing events.
#[derive(Debug, Clone)]
pub struct EventBus {
    capacity: usize,
    firehose: broadcast::Sender<BusEvent>,
    topics: Arc<RwLock<FnvHashMap<SmolStr, broadcast::Sender<BusEvent>>>>,
    reliable: Arc<RwLock<Vec<mpsc::Sender<BusEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            firehose: broadcast::channel(capacity).0,
            topics: Arc::new(RwLock::new(FnvHashMap::default())),
            reliable: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Publish to every reliable subscriber, waiting while any of their queues is full, then to
    /// the event's symbol topic and the firehose. Returns the total receiver count.
    pub async fn publish(&self, event: BusEvent) -> usize {
        let reliable = self.reliable.read().clone();
        let mut delivered = 0;
        let mut closed = false;
        for tx in reliable {
            match tx.send(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => closed = true,
            }
        }
        if closed {
            self.reliable.write().retain(|tx| !tx.is_closed());
        }

        let on_topic = self
            .topics
            .read()
            .get(event.symbol())
            .map_or(0, |tx| tx.send(event.clone()).unwrap_or(0));

        delivered + on_topic + self.firehose.send(event).unwrap_or(0)
    }

    /// Subscribe to every event without loss, see [`EventBus`].
    ///
    /// The receiver yields `None` once every clone of the bus is dropped.
    pub fn subscribe_reliable(&self) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.reliable.write().push(tx);
        rx
    }

    pub fn subscribe(&self, symbol: &str) -> broadcast::Receiver<BusEvent> {
        if let Some(tx) = self.topics.read().get(symbol) {
            return tx.subscribe();
        }

        self.topics
            .write()
            .entry(SmolStr::new(symbol))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BusEvent> {
        self.firehose.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Ohlcv;

    fn closed(symbol: &str, seq: u64) -> BusEvent {
        BusEvent::BarClosed(Bar1m::new(symbol, seq, seq as i64 * 60_000, Ohlcv::default()))
    }

    #[tokio::test]
    async fn test_symbol_topics_only_receive_their_symbol() {
        let bus = EventBus::new(16);
        let mut spy = bus.subscribe("SPY");
        let mut all = bus.subscribe_all();

        assert_eq!(bus.publish(closed("QQQ", 1)).await, 1);
        assert_eq!(bus.publish(closed("SPY", 2)).await, 2);

        assert_eq!(spy.recv().await.unwrap(), closed("SPY", 2));
        assert!(spy.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap().symbol(), "QQQ");
        assert_eq!(all.recv().await.unwrap().symbol(), "SPY");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(closed("SPY", 1)).await, 0);
    }

    #[tokio::test]
    async fn test_reliable_subscriber_never_lags() {
        let bus = EventBus::new(2);
        let mut reliable = bus.subscribe_reliable();
        let mut advisory = bus.subscribe_all();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for seq in 1..=5 {
                    bus.publish(closed("SPY", seq)).await;
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 5 {
            match reliable.recv().await.unwrap() {
                BusEvent::BarClosed(bar) => received.push(bar.seq),
                other => panic!("unexpected {other:?}"),
            }
        }
        publisher.await.unwrap();

        assert_eq!(received, vec![1, 2, 3, 4, 5]);
        // The advisory firehose kept only the newest events
        assert!(matches!(
            advisory.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        drop(bus);
        assert!(reliable.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_reliable_subscriber_is_pruned() {
        let bus = EventBus::new(4);
        let kept = bus.subscribe_reliable();
        drop(bus.subscribe_reliable());

        assert_eq!(bus.publish(closed("SPY", 1)).await, 1);
        assert_eq!(bus.reliable.read().len(), 1);
        drop(kept);
    }
}
