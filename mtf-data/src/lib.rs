#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cast_possible_truncation,
    clippy::unused_self,
    clippy::cast_sign_loss,
    rust_2018_idioms
)]

//! # MTF-Data
//! Gap-free multi-timeframe bar data derived from a single 1-minute timeline.
//!
//! Every timeframe a chart can display is computed from one bounded, per-symbol store of closed
//! 1-minute bars. Nothing but the 1-minute feed is ever subscribed upstream, so switching a chart
//! from `1m` to `5m` to `1h` is a pure re-derivation with no reconnect and no gap.
//!
//! ## Components
//! * [`Bar1mBuffer`](buffer::Bar1mBuffer): bounded per-symbol ring of closed 1-minute bars.
//! * [`rollup`]: pure batch and incremental k-minute aggregation.
//! * [`RollupCache`](cache::RollupCache): batch rollups gated on the 1-minute sequence counter.
//! * [`TimeframeSwitchCoordinator`](switch::TimeframeSwitchCoordinator): per `(user, symbol)`
//!   timeframe sessions driven by 1-minute closes.
//! * [`StreamDistributor`](distributor::StreamDistributor): fan-out of sequenced
//!   [`StreamEvent`](protocol::StreamEvent)s to stream connections.
//! * [`MarketDataHub`](hub::MarketDataHub): the pipeline wiring the [`EventBus`](bus::EventBus)
//!   to all of the above.

/// 1-minute, rolled, tick and epoch data types.
pub mod bar;

/// Bounded per-symbol store of closed 1-minute bars.
pub mod buffer;

/// Typed in-process publish/subscribe bus carrying upstream bar and tick notifications.
pub mod bus;

/// Sequence-gated cache of batch rollups.
pub mod cache;

/// Fan-out of stream envelopes to connected subscribers.
pub mod distributor;

/// All [`Error`](std::error::Error)s generated in MTF-Data.
pub mod error;

/// Server-side pipeline owning every component for one process lifetime.
pub mod hub;

/// Named stream events and subscription filtering.
pub mod protocol;

/// Pure 1-minute to k-minute aggregation.
pub mod rollup;

/// Timeframe sessions and the coordinator switching between them.
pub mod switch;

/// Strongly typed k-minute timeframe.
pub mod timeframe;

pub use bar::{Bar1m, Epoch, Ohlcv, RolledBar, Tick};
pub use buffer::{Bar1mBuffer, Bar1mSource};
pub use error::DataError;
pub use hub::{HistoryQuery, HubConfig, MarketDataHub, SessionWatch};
pub use protocol::{StreamEnvelope, StreamEvent, SubscriptionFilter};
pub use switch::{SwitchOutcome, TimeframeSwitchCoordinator};
pub use timeframe::Timeframe;
