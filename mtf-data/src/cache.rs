use crate::{bar::RolledBar, timeframe::Timeframe};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// Default maximum age of a cached rollup.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(60);

/// Cached rollup result tagged with the 1-minute sequence counter it was computed from.
#[derive(Debug, Clone)]
pub struct RollupCacheEntry {
    pub last_seq: u64,
    pub bars: Arc<[RolledBar]>,
    pub timestamp: Instant,
}

/// Per `(symbol, timeframe)` cache of the most recent batch rollup.
///
/// An entry is only served while its `last_seq` equals the symbol's current 1-minute sequence
/// counter and it is younger than `max_age`. Any other lookup evicts the entry.
#[derive(Debug)]
pub struct RollupCache {
    max_age: Duration,
    entries: Mutex<FnvHashMap<(SmolStr, Timeframe), RollupCacheEntry>>,
}

impl Default for RollupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_AGE)
    }
}

impl RollupCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn get(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        current_seq: u64,
    ) -> Option<Arc<[RolledBar]>> {
        let mut entries = self.entries.lock();
        self.get_valid(&mut entries, &(SmolStr::new(symbol), timeframe), current_seq)
    }

    pub fn set(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        last_seq: u64,
        bars: Vec<RolledBar>,
    ) -> Arc<[RolledBar]> {
        let bars: Arc<[RolledBar]> = bars.into();
        self.entries.lock().insert(
            (SmolStr::new(symbol), timeframe),
            RollupCacheEntry {
                last_seq,
                bars: bars.clone(),
                timestamp: Instant::now(),
            },
        );
        bars
    }

    /// Serve the cached rollup or recompute it, as a single unit under the cache lock.
    ///
    /// A concurrent `set` can therefore never interleave between the `last_seq` check and the
    /// use of the entry.
    pub fn get_or_compute<F>(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        current_seq: u64,
        compute: F,
    ) -> Arc<[RolledBar]>
    where
        F: FnOnce() -> Vec<RolledBar>,
    {
        let key = (SmolStr::new(symbol), timeframe);
        let mut entries = self.entries.lock();

        if let Some(bars) = self.get_valid(&mut entries, &key, current_seq) {
            return bars;
        }

        let bars: Arc<[RolledBar]> = compute().into();
        debug!(
            %symbol,
            %timeframe,
            current_seq,
            bars = bars.len(),
            "recomputed rollup"
        );
        entries.insert(
            key,
            RollupCacheEntry {
                last_seq: current_seq,
                bars: bars.clone(),
                timestamp: Instant::now(),
            },
        );
        bars
    }

    /// Drop one timeframe, or every timeframe when `timeframe` is `None`, for `symbol`.
    ///
    /// Must run on every 1-minute close for the symbol since any close can move the open bucket of
    /// every timeframe.
    pub fn invalidate(&self, symbol: &str, timeframe: Option<Timeframe>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        match timeframe {
            Some(timeframe) => {
                entries.remove(&(SmolStr::new(symbol), timeframe));
            }
            None => entries.retain(|(cached, _), _| cached.as_str() != symbol),
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_valid(
        &self,
        entries: &mut FnvHashMap<(SmolStr, Timeframe), RollupCacheEntry>,
        key: &(SmolStr, Timeframe),
        current_seq: u64,
    ) -> Option<Arc<[RolledBar]>> {
        let entry = entries.get(key)?;
        if entry.last_seq == current_seq && entry.timestamp.elapsed() < self.max_age {
            return Some(entry.bars.clone());
        }

        debug!(
            symbol = %key.0,
            timeframe = %key.1,
            cached_seq = entry.last_seq,
            current_seq,
            "evicting stale rollup"
        );
        entries.remove(key);
        None
    }
}
