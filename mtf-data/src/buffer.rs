//! Bounded per-symbol store of closed 1-minute bars.
//!
//! The [`Bar1mBuffer`] is the single source of truth every timeframe is derived from. It assumes
//! one writer per symbol (the upstream bar builder) and any number of concurrent readers; every
//! read returns an owned snapshot as of the call.

use crate::{bar::Bar1m, error::DataError};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default ring capacity per symbol (~3.5 regular trading days of 1-minute bars).
pub const DEFAULT_BAR1M_CAPACITY: usize = 5_000;

/// Outcome of [`Bar1mBuffer::reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// True when an existing bar was replaced in place, false when the bar was inserted as a
    /// gap-fill.
    pub replaced: bool,
    /// The bar that was replaced, kept for audit diffs.
    pub previous: Option<Bar1m>,
}

/// Read access to recent 1-minute history, implemented by [`Bar1mBuffer`].
pub trait Bar1mSource: Send + Sync {
    /// Up to `n` most recent bars in ascending order.
    fn recent(&self, symbol: &str, n: usize) -> Result<Vec<Bar1m>, DataError>;

    /// Every stored bar with `seq > after_seq`, ascending.
    fn since_seq(&self, symbol: &str, after_seq: u64) -> Result<Vec<Bar1m>, DataError>;
}

#[derive(Debug)]
pub struct Bar1mBuffer {
    capacity: usize,
    rings: RwLock<FnvHashMap<SmolStr, VecDeque<Bar1m>>>,
}

impl Default for Bar1mBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BAR1M_CAPACITY)
    }
}

impl Bar1mBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a closed bar, evicting the oldest bar once the ring is full.
    ///
    /// Bars must strictly advance both `seq` and `bar_start`; anything else is rejected so the
    /// ring never holds out-of-order history.
    pub fn append(&self, bar: Bar1m) -> Result<(), DataError> {
        let mut rings = self.rings.write();
        let ring = rings
            .entry(bar.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(1024)));

        if let Some(last) = ring.back() {
            if bar.seq <= last.seq {
                warn!(
                    symbol = %bar.symbol,
                    last_seq = last.seq,
                    seq = bar.seq,
                    "rejecting out-of-order 1m bar"
                );
                return Err(DataError::OutOfOrder {
                    symbol: bar.symbol,
                    last_seq: last.seq,
                    seq: bar.seq,
                });
            }
            if bar.bar_start <= last.bar_start {
                warn!(
                    symbol = %bar.symbol,
                    last_bar_start = last.bar_start,
                    bar_start = bar.bar_start,
                    "rejecting 1m bar that does not advance the bucket"
                );
                return Err(DataError::StaleBucket {
                    symbol: bar.symbol,
                    last_bar_start: last.bar_start,
                    bar_start: bar.bar_start,
                });
            }
        }

        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(bar);
        Ok(())
    }

    /// The last `n` bars in ascending `bar_start` order.
    pub fn get_recent(&self, symbol: &str, n: usize) -> Vec<Bar1m> {
        let rings = self.rings.read();
        match rings.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(n);
                ring.range(start..).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Every bar with `seq > after_seq`.
    pub fn get_since_seq(&self, symbol: &str, after_seq: u64) -> Vec<Bar1m> {
        let rings = self.rings.read();
        match rings.get(symbol) {
            Some(ring) => {
                let start = ring.partition_point(|bar| bar.seq <= after_seq);
                ring.range(start..).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Every bar whose `bar_start` falls in `[start_ms, end_ms)`.
    pub fn get_range(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<Bar1m> {
        if end_ms <= start_ms {
            return Vec::new();
        }

        let rings = self.rings.read();
        match rings.get(symbol) {
            Some(ring) => {
                let start = ring.partition_point(|bar| bar.bar_start < start_ms);
                let end = ring.partition_point(|bar| bar.bar_start < end_ms);
                ring.range(start..end).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn peek_last(&self, symbol: &str) -> Option<Bar1m> {
        self.rings
            .read()
            .get(symbol)
            .and_then(|ring| ring.back().cloned())
    }

    /// The 1-minute sequence counter for `symbol`: the seq of the newest stored bar, or 0.
    pub fn current_seq(&self, symbol: &str) -> u64 {
        self.rings
            .read()
            .get(symbol)
            .and_then(|ring| ring.back().map(|bar| bar.seq))
            .unwrap_or(0)
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.rings.read().get(symbol).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }

    pub fn symbols(&self) -> Vec<SmolStr> {
        let mut symbols = self.rings.read().keys().cloned().collect::<Vec<_>>();
        symbols.sort();
        symbols
    }

    /// Drop all history for `symbol`, returning how many bars were removed.
    pub fn clear(&self, symbol: &str) -> usize {
        let removed = self
            .rings
            .write()
            .remove(symbol)
            .map_or(0, |ring| ring.len());
        debug!(%symbol, removed, "cleared 1m history");
        removed
    }

    /// Replace a corrected bar in place, matched first by `seq` and then by `bar_end`.
    ///
    /// With no match the bar is inserted at its `seq` position as a gap-fill.
    pub fn reconcile(&self, bar: Bar1m) -> Reconciled {
        let mut rings = self.rings.write();
        let ring = rings
            .entry(bar.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(1024)));

        let position = ring
            .iter()
            .position(|stored| stored.seq == bar.seq)
            .or_else(|| ring.iter().position(|stored| stored.bar_end == bar.bar_end));

        match position {
            Some(index) => {
                let previous = std::mem::replace(&mut ring[index], bar);
                Reconciled {
                    replaced: true,
                    previous: Some(previous),
                }
            }
            None => {
                let index = ring.partition_point(|stored| stored.seq < bar.seq);
                ring.insert(index, bar);
                if ring.len() > self.capacity {
                    ring.pop_front();
                }
                Reconciled {
                    replaced: false,
                    previous: None,
                }
            }
        }
    }
}

impl Bar1mSource for Bar1mBuffer {
    fn recent(&self, symbol: &str, n: usize) -> Result<Vec<Bar1m>, DataError> {
        Ok(self.get_recent(symbol, n))
    }

    fn since_seq(&self, symbol: &str, after_seq: u64) -> Result<Vec<Bar1m>, DataError> {
        Ok(self.get_since_seq(symbol, after_seq))
    }
}
