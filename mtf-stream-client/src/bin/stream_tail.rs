//! Tails the bar stream and logs every consumer event.
//!
//! Configured through `MTF_URL`, `MTF_SYMBOLS` (csv), `MTF_TIMEFRAME`, `MTF_USER` and
//! `MTF_STATE_FILE`.

use mtf_data::Timeframe;
use mtf_stream_client::{
    ConsumerEvent, FileStateStore, StreamClient, StreamClientConfig, config::DEFAULT_BASE_URL,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let url = std::env::var("MTF_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let config = match StreamClientConfig::parse(&url) {
        Ok(config) => config,
        Err(error) => {
            error!(%url, %error, "invalid server url");
            return;
        }
    };

    let timeframe = match std::env::var("MTF_TIMEFRAME") {
        Ok(raw) => match raw.parse::<Timeframe>() {
            Ok(timeframe) => timeframe,
            Err(error) => {
                error!(%raw, %error, "invalid timeframe");
                return;
            }
        },
        Err(_) => Timeframe::M1,
    };

    let symbols = std::env::var("MTF_SYMBOLS").unwrap_or_else(|_| "SPY".to_string());
    let mut config = config
        .with_symbols(
            symbols
                .split(',')
                .map(str::trim)
                .filter(|symbol| !symbol.is_empty()),
        )
        .with_timeframe(timeframe);
    if let Ok(user) = std::env::var("MTF_USER") {
        config = config.with_user(user);
    }

    let mut client = StreamClient::new(config);
    if let Ok(path) = std::env::var("MTF_STATE_FILE") {
        match FileStateStore::open(&path) {
            Ok(store) => client = client.with_store(Arc::new(store)),
            Err(error) => warn!(%path, %error, "ignoring unreadable state file"),
        }
    }

    let (handle, mut events) = client.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ConsumerEvent::Bar(bar)) => info!(
                    symbol = %bar.symbol,
                    timeframe = %bar.timeframe,
                    seq = bar.seq,
                    open = bar.ohlcv.open,
                    high = bar.ohlcv.high,
                    low = bar.ohlcv.low,
                    close = bar.ohlcv.close,
                    volume = bar.ohlcv.volume,
                    "bar"
                ),
                Some(ConsumerEvent::Gap { key, expected, received }) => {
                    warn!(symbol = %key.symbol, timeframe = %key.timeframe, expected, received, "gap")
                }
                Some(ConsumerEvent::Status(status)) => info!(?status, "status"),
                Some(ConsumerEvent::EpochChanged { previous, current }) => {
                    info!(?previous, %current, "epoch")
                }
                Some(ConsumerEvent::Reset(reset)) => info!(
                    symbol = %reset.symbol,
                    timeframe = %reset.timeframe,
                    seq = reset.seq,
                    bars = reset.bars.len(),
                    "reset"
                ),
                Some(ConsumerEvent::MicroBar(_) | ConsumerEvent::Tick(_)) => {}
                None => break,
            },
        }
    }

    info!(reconnects = handle.reconnect_count(), "shutting down");
    handle.shutdown().await;
}
