use crate::protocol::{StreamEnvelope, SubscriptionFilter};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::warn;

/// Default number of envelopes buffered for slow stream connections.
pub const DEFAULT_BROADCAST_BUFFER: usize = 10_000;

/// Fan-out of [`StreamEnvelope`]s to every connected stream subscriber.
///
/// Clone-able handle over a single `broadcast` channel. Each connection applies its own
/// [`SubscriptionFilter`].
#[derive(Debug, Clone)]
pub struct StreamDistributor {
    tx: broadcast::Sender<StreamEnvelope>,
}

impl Default for StreamDistributor {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_BUFFER)
    }
}

impl StreamDistributor {
    pub fn new(buffer: usize) -> Self {
        Self {
            tx: broadcast::channel(buffer.max(1)).0,
        }
    }

    /// Publish an envelope and return the number of receivers it reached.
    pub fn publish(&self, envelope: StreamEnvelope) -> usize {
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEnvelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Filtered stream of envelopes for one connection.
    ///
    /// A lagging receiver skips the overwritten envelopes; the client repairs the hole via gap
    /// detection.
    pub fn stream(&self, filter: SubscriptionFilter) -> impl Stream<Item = StreamEnvelope> + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |result| {
            let next = match result {
                Ok(envelope) if filter.matches(&envelope) => Some(envelope),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(
                        user = %filter.user,
                        skipped,
                        "stream subscriber lagged, envelopes dropped"
                    );
                    None
                }
            };
            std::future::ready(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bar::{Bar1m, Epoch, Ohlcv, RolledBar},
        protocol::StreamEvent,
        timeframe::Timeframe,
    };

    fn bar(symbol: &str, seq: u64) -> StreamEnvelope {
        StreamEnvelope::broadcast(StreamEvent::Bar(RolledBar::from(&Bar1m::new(
            symbol,
            seq,
            seq as i64 * 60_000,
            Ohlcv::default(),
        ))))
    }

    #[tokio::test]
    async fn test_stream_applies_filter() {
        let distributor = StreamDistributor::new(16);
        let stream = distributor.stream(SubscriptionFilter::new("alice", ["SPY"], Timeframe::M1));
        futures::pin_mut!(stream);

        distributor.publish(bar("QQQ", 1));
        distributor.publish(StreamEnvelope::for_user("bob", bar("SPY", 1).event));
        distributor.publish(bar("SPY", 2));
        distributor.publish(StreamEnvelope::broadcast(StreamEvent::Epoch(Epoch::new("e", 0))));

        assert_eq!(stream.next().await, Some(bar("SPY", 2)));
        assert_eq!(stream.next().await.map(|e| e.event.name()), Some("epoch"));
    }

    #[tokio::test]
    async fn test_stream_continues_after_lag() {
        let distributor = StreamDistributor::new(2);
        let stream = distributor.stream(SubscriptionFilter::new("alice", ["SPY"], Timeframe::M1));
        futures::pin_mut!(stream);

        for seq in 1..=5 {
            distributor.publish(bar("SPY", seq));
        }

        assert_eq!(stream.next().await, Some(bar("SPY", 4)));
        assert_eq!(stream.next().await, Some(bar("SPY", 5)));
    }

    #[test]
    fn test_publish_counts_receivers() {
        let distributor = StreamDistributor::default();
        assert_eq!(distributor.publish(bar("SPY", 1)), 0);

        let _rx = distributor.subscribe();
        assert_eq!(distributor.receiver_count(), 1);
        assert_eq!(distributor.publish(bar("SPY", 2)), 1);
    }
}
