//! # MTF Stream Client
//! Client side of the sequenced multi-timeframe bar stream.
//!
//! The library includes:
//! - [`StreamConsumer`]: transport independent state machine that tracks `seq` per
//!   `(symbol, timeframe)`, detects gaps, serialises backfill against forward bars and resets on
//!   an upstream epoch change.
//! - [`StreamClient`]: async driver that reads the SSE stream, reconnects with jittered
//!   exponential [`Backoff`] and fetches history through a [`HistorySource`].
//! - [`TimeframeSelection`]: optimistic timeframe switch with a configurable rollback.
//! - [`StateStore`]: persisted `lastSeq` so a restarted client resumes gap detection.

/// Async stream driver and its control handle.
pub mod client;

/// Builder style client configuration.
pub mod config;

/// Sequence tracking, gap detection and backfill state machine.
pub mod consumer;

/// History and timeframe switch REST calls.
pub mod api;

/// Reconnect delay calculation.
pub mod backoff;

/// All errors generated in `mtf-stream-client`.
pub mod error;

/// Per-stream `seq` classification into accept, duplicate and gap.
pub mod sequence;

/// `text/event-stream` decoding.
pub mod sse;

/// Persisted per-stream progress.
pub mod store;

/// Optimistic chart timeframe selection.
pub mod timeframe;

pub use api::{HistorySource, HttpApi};
pub use backoff::Backoff;
pub use client::{StreamClient, StreamHandle};
pub use config::StreamClientConfig;
pub use consumer::{BackfillRequest, ConnectionStatus, ConsumerEvent, StreamConsumer, StreamKey};
pub use error::ClientError;
pub use sequence::{SeqCheck, SequenceTracker};
pub use store::{FileStateStore, MemoryStateStore, StateKey, StateStore};
pub use timeframe::{RollbackPolicy, TimeframeSelection};

#[cfg(test)]
mod tests {
    #[test]
    fn test_every_module_is_documented() {
        let source = include_str!("lib.rs");
        let lines = source.lines().collect::<Vec<_>>();

        let undocumented = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.starts_with("pub mod "))
            .filter(|(index, _)| *index == 0 || !lines[index - 1].starts_with("///"))
            .map(|(_, line)| *line)
            .collect::<Vec<_>>();

        assert!(undocumented.is_empty(), "undocumented: {undocumented:?}");
    }
}
