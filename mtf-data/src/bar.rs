use crate::timeframe::Timeframe;
use chrono::Utc;
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Width of a 1-minute bucket in milliseconds.
pub const BAR_1M_MS: i64 = 60_000;

/// Current UTC wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Open, high, low, close and volume of a bucket.
///
/// Values are passed through exactly as received; rounding is a presentation concern.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct Ohlcv {
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Ohlcv {
    pub fn new(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Closed 1-minute bar produced by the upstream bar builder.
///
/// `seq` increases monotonically per symbol and `bar_end - bar_start` is always one minute.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar1m {
    pub symbol: SmolStr,
    pub seq: u64,
    /// Bucket start, UTC epoch milliseconds (inclusive).
    pub bar_start: i64,
    /// Bucket end, UTC epoch milliseconds (exclusive).
    pub bar_end: i64,
    #[serde(flatten)]
    pub ohlcv: Ohlcv,
}

impl Bar1m {
    pub fn new(symbol: impl Into<SmolStr>, seq: u64, bar_start: i64, ohlcv: Ohlcv) -> Self {
        Self {
            symbol: symbol.into(),
            seq,
            bar_start,
            bar_end: bar_start.saturating_add(BAR_1M_MS),
            ohlcv,
        }
    }
}

/// Bar aggregated from 1-minute bars into a k-minute [`Timeframe`].
///
/// `seq` is scoped to the rollup session that produced the bar (a batch rollup or a live
/// timeframe session), not a global identifier.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RolledBar {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    pub seq: u64,
    pub bar_start: i64,
    pub bar_end: i64,
    pub ohlcv: Ohlcv,
}

impl RolledBar {
    /// Whether `ts_ms` falls within this bar's `[bar_start, bar_end)` bucket.
    pub fn contains(&self, ts_ms: i64) -> bool {
        (self.bar_start..self.bar_end).contains(&ts_ms)
    }
}

impl From<&Bar1m> for RolledBar {
    fn from(bar: &Bar1m) -> Self {
        Self {
            symbol: bar.symbol.clone(),
            timeframe: Timeframe::M1,
            seq: bar.seq,
            bar_start: bar.bar_start,
            bar_end: bar.bar_end,
            ohlcv: bar.ohlcv,
        }
    }
}

/// Raw trade print. Advisory only, never sequenced.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Tick {
    pub symbol: SmolStr,
    pub price: f64,
    pub size: f64,
    /// Trade time, UTC epoch milliseconds.
    pub ts: i64,
}

/// Marker for one continuous run of the upstream 1-minute stream.
///
/// A new epoch is minted every time the stream restarts, telling clients to discard their
/// sequence bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    pub epoch_id: SmolStr,
    pub epoch_start_ms: i64,
}

impl Epoch {
    pub fn new(epoch_id: impl Into<SmolStr>, epoch_start_ms: i64) -> Self {
        Self {
            epoch_id: epoch_id.into(),
            epoch_start_ms,
        }
    }

    /// Mint a fresh epoch starting now.
    pub fn start() -> Self {
        let epoch_start_ms = now_ms();
        let epoch_id = format!("{epoch_start_ms:x}-{:08x}", rand::random::<u32>());
        Self::new(epoch_id, epoch_start_ms)
    }
}
