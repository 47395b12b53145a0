//! Wire protocol pushed from the server to stream subscribers.
//!
//! Every [`StreamEvent`] is sent as a named Server-Sent-Event whose `data` line is the JSON
//! payload of the variant.

use crate::{
    bar::{Epoch, RolledBar, Tick},
    error::DataError,
    timeframe::Timeframe,
};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// SSE event name of a finalized, sequenced bar.
/// Port the server listens on and clients connect to unless configured otherwise.
pub const DEFAULT_PORT: u16 = 9001;

pub const EVENT_BAR: &str = "bar";
/// SSE event name of an in-progress snapshot of the open bucket.
pub const EVENT_MICROBAR: &str = "microbar";
/// SSE event name of a raw trade print.
pub const EVENT_TICK: &str = "tick";
/// SSE event name of a full-replace timeframe snapshot.
pub const EVENT_RESET: &str = "bar:reset";
/// SSE event name of an upstream stream-restart marker.
pub const EVENT_EPOCH: &str = "epoch";

/// Full-replace snapshot of a timeframe, sent after every timeframe switch.
///
/// Recipients must discard any local incremental state and redraw from `bars` (finalized, seq
/// `1..=seq`) plus the still-open `current` bucket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResetPayload {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    pub seq: u64,
    pub bars: Vec<RolledBar>,
    pub current: Option<RolledBar>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Bar(RolledBar),
    MicroBar(RolledBar),
    Tick(Tick),
    Reset(ResetPayload),
    Epoch(Epoch),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Bar(_) => EVENT_BAR,
            StreamEvent::MicroBar(_) => EVENT_MICROBAR,
            StreamEvent::Tick(_) => EVENT_TICK,
            StreamEvent::Reset(_) => EVENT_RESET,
            StreamEvent::Epoch(_) => EVENT_EPOCH,
        }
    }

    pub fn symbol(&self) -> Option<&SmolStr> {
        match self {
            StreamEvent::Bar(bar) | StreamEvent::MicroBar(bar) => Some(&bar.symbol),
            StreamEvent::Tick(tick) => Some(&tick.symbol),
            StreamEvent::Reset(reset) => Some(&reset.symbol),
            StreamEvent::Epoch(_) => None,
        }
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        match self {
            StreamEvent::Bar(bar) | StreamEvent::MicroBar(bar) => Some(bar.timeframe),
            StreamEvent::Reset(reset) => Some(reset.timeframe),
            StreamEvent::Tick(_) | StreamEvent::Epoch(_) => None,
        }
    }

    /// Sequence number, only present on finalized bars.
    pub fn seq(&self) -> Option<u64> {
        match self {
            StreamEvent::Bar(bar) => Some(bar.seq),
            _ => None,
        }
    }

    /// JSON `data` payload of the event.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            StreamEvent::Bar(bar) | StreamEvent::MicroBar(bar) => serde_json::to_string(bar),
            StreamEvent::Tick(tick) => serde_json::to_string(tick),
            StreamEvent::Reset(reset) => serde_json::to_string(reset),
            StreamEvent::Epoch(epoch) => serde_json::to_string(epoch),
        }
    }

    /// Decode a named SSE frame back into a [`StreamEvent`].
    pub fn from_named(name: &str, data: &str) -> Result<Self, DataError> {
        let decode_error = |error: serde_json::Error| DataError::Decode {
            event: name.to_string(),
            reason: error.to_string(),
        };

        match name {
            EVENT_BAR => serde_json::from_str(data).map(StreamEvent::Bar),
            EVENT_MICROBAR => serde_json::from_str(data).map(StreamEvent::MicroBar),
            EVENT_TICK => serde_json::from_str(data).map(StreamEvent::Tick),
            EVENT_RESET => serde_json::from_str(data).map(StreamEvent::Reset),
            EVENT_EPOCH => serde_json::from_str(data).map(StreamEvent::Epoch),
            other => {
                return Err(DataError::Decode {
                    event: other.to_string(),
                    reason: "unknown event name".to_string(),
                });
            }
        }
        .map_err(decode_error)
    }
}

/// A [`StreamEvent`] addressed either to every subscriber or to a single user's connections.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEnvelope {
    pub user: Option<SmolStr>,
    pub event: StreamEvent,
}

impl StreamEnvelope {
    pub fn broadcast(event: StreamEvent) -> Self {
        Self { user: None, event }
    }

    pub fn for_user(user: impl Into<SmolStr>, event: StreamEvent) -> Self {
        Self {
            user: Some(user.into()),
            event,
        }
    }
}

/// Selects the envelopes one stream connection receives.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionFilter {
    pub user: SmolStr,
    pub symbols: FnvHashSet<SmolStr>,
    pub timeframe: Timeframe,
}

impl SubscriptionFilter {
    pub fn new<Iter, S>(user: impl Into<SmolStr>, symbols: Iter, timeframe: Timeframe) -> Self
    where
        Iter: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        Self {
            user: user.into(),
            symbols: symbols.into_iter().map(Into::into).collect(),
            timeframe,
        }
    }

    pub fn matches(&self, envelope: &StreamEnvelope) -> bool {
        if envelope
            .user
            .as_ref()
            .is_some_and(|user| user != &self.user)
        {
            return false;
        }

        match &envelope.event {
            StreamEvent::Epoch(_) => true,
            StreamEvent::Tick(tick) => self.symbols.contains(&tick.symbol),
            event => {
                event
                    .symbol()
                    .is_some_and(|symbol| self.symbols.contains(symbol))
                    && event.timeframe() == Some(self.timeframe)
            }
        }
    }
}
