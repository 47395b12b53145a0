//! Transport independent client state machine for the sequenced bar stream.
//!
//! The [`StreamConsumer`] is fed decoded [`StreamEvent`]s in arrival order and tells its caller
//! which history ranges to fetch. Backfill for a `(symbol, timeframe)` is serialised against
//! forward bars for that key: forward bars queue until the backfill result is applied, so every
//! listener observes strictly ascending `seq`.

use crate::{
    sequence::{SeqCheck, SequenceTracker},
    store::{StateKey, StateStore},
};
use fnv::FnvHashMap;
use mtf_data::{
    Epoch, RolledBar, StreamEvent, Tick, Timeframe,
    protocol::ResetPayload,
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Live,
    DegradedWs,
    ReplayingGap,
    Error,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct StreamKey {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
}

impl StreamKey {
    pub fn new(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: SmolStr::new(symbol),
            timeframe,
        }
    }

    fn of(bar: &RolledBar) -> Self {
        Self {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
        }
    }
}

/// History fetch the caller must perform and hand back via [`StreamConsumer::apply_backfill`].
///
/// Covers `seq` in `(after_seq, up_to_seq]`; `up_to_seq == None` is an open ended catch-up.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BackfillRequest {
    pub id: u64,
    pub key: StreamKey,
    pub after_seq: u64,
    pub up_to_seq: Option<u64>,
}

/// Notifications delivered to listeners, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Bar(RolledBar),
    MicroBar(RolledBar),
    Tick(Tick),
    Reset(ResetPayload),
    Gap {
        key: StreamKey,
        expected: u64,
        received: u64,
    },
    EpochChanged {
        previous: Option<SmolStr>,
        current: SmolStr,
    },
    Status(ConnectionStatus),
}

pub type Listener = Box<dyn FnMut(&ConsumerEvent) + Send>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct KeyState {
    tracker: SequenceTracker,
    /// Forward bars held back while a backfill is in flight, keyed by seq.
    pending: BTreeMap<u64, RolledBar>,
    in_flight: Option<u64>,
    /// End of the last finalized bar, older microbars are stale.
    last_bar_end: i64,
}

pub struct StreamConsumer {
    status: ConnectionStatus,
    epoch: Option<Epoch>,
    keys: FnvHashMap<StreamKey, KeyState>,
    listeners: Vec<(ListenerId, Listener)>,
    store: Option<Arc<dyn StateStore>>,
    next_listener: u64,
    next_request: u64,
    reconnects: u64,
    closed: bool,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("status", &self.status)
            .field("epoch", &self.epoch)
            .field("keys", &self.keys)
            .field("listeners", &self.listeners.len())
            .field("reconnects", &self.reconnects)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            epoch: None,
            keys: FnvHashMap::default(),
            listeners: Vec::new(),
            store: None,
            next_listener: 0,
            next_request: 0,
            reconnects: 0,
            closed: false,
        }
    }

    /// Persist every applied `seq` through `store`, and resume from it when an epoch is first seen.
    pub fn with_store(self, store: Arc<dyn StateStore>) -> Self {
        Self {
            store: Some(store),
            ..self
        }
    }

    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ConsumerEvent) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        if !self.closed {
            self.listeners.push((id, Box::new(listener)));
        }
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener, _)| *listener != id);
        before != self.listeners.len()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn epoch(&self) -> Option<&Epoch> {
        self.epoch.as_ref()
    }

    pub fn last_seq(&self, key: &StreamKey) -> u64 {
        self.keys
            .get(key)
            .map_or(0, |state| state.tracker.last_seq())
    }

    /// `sinceSeq` to resume a `timeframe` stream from: the lowest progress over its tracked keys,
    /// or `None` while any of them has not seen a bar yet.
    pub fn resume_seq(&self, timeframe: Timeframe) -> Option<u64> {
        self.keys
            .iter()
            .filter(|(key, _)| key.timeframe == timeframe)
            .map(|(_, state)| state.tracker.last_seq())
            .min()
            .filter(|seq| *seq > 0)
    }

    /// Number of reconnect attempts so far.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start tracking `key` before its first bar arrives, so catch-up covers it.
    pub fn track(&mut self, key: StreamKey) {
        self.keys.entry(key).or_default();
    }

    /// Stop tracking every key `keep` rejects, e.g. after a timeframe switch.
    pub fn retain_keys<F>(&mut self, mut keep: F)
    where
        F: FnMut(&StreamKey) -> bool,
    {
        self.keys.retain(|key, _| keep(key));
    }

    pub fn on_connecting(&mut self) {
        self.set_status(ConnectionStatus::Connecting);
    }

    /// The transport opened, returns the catch-up fetches to run.
    pub fn on_open(&mut self) -> Vec<BackfillRequest> {
        self.set_status(ConnectionStatus::Connected);
        self.catch_up_requests()
    }

    /// The transport failed and a reconnect will be attempted.
    pub fn on_disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.reconnects += 1;
        self.set_status(ConnectionStatus::DegradedWs);
    }

    /// Feed one decoded event, returning a backfill to run when it revealed a gap.
    pub fn on_event(&mut self, event: StreamEvent) -> Option<BackfillRequest> {
        if self.closed {
            return None;
        }

        match event {
            StreamEvent::Bar(bar) => return self.on_bar(bar),
            StreamEvent::MicroBar(bar) => {
                let stale = self
                    .keys
                    .get(&StreamKey::of(&bar))
                    .is_some_and(|state| bar.bar_start < state.last_bar_end);
                if stale {
                    debug!(symbol = %bar.symbol, timeframe = %bar.timeframe, "dropping stale microbar");
                } else {
                    self.notify(&ConsumerEvent::MicroBar(bar));
                }
            }
            StreamEvent::Tick(tick) => self.notify(&ConsumerEvent::Tick(tick)),
            StreamEvent::Reset(reset) => self.on_reset(reset),
            StreamEvent::Epoch(epoch) => self.on_epoch(epoch),
        }
        None
    }

    /// Opportunistic since-`last_seq` fetches for every key that has progress and no fetch in
    /// flight. Runs on reopen and when the user returns to the chart.
    pub fn catch_up_requests(&mut self) -> Vec<BackfillRequest> {
        if self.closed {
            return Vec::new();
        }

        let mut requests = Vec::new();
        for (key, state) in self.keys.iter_mut() {
            if state.in_flight.is_some() || state.tracker.last_seq() == 0 {
                continue;
            }
            self.next_request += 1;
            state.in_flight = Some(self.next_request);
            requests.push(BackfillRequest {
                id: self.next_request,
                key: key.clone(),
                after_seq: state.tracker.last_seq(),
                up_to_seq: None,
            });
        }
        requests
    }

    /// Apply the result of `request` in ascending `seq`, then release the bars queued behind it.
    ///
    /// A queued bar is only released past a hole the server was asked to fill and could not. A
    /// hole outside the answered range keeps the bars behind it queued and yields the follow-up
    /// request to run, so the stream never skips history it has not asked for.
    ///
    /// Results for a request that is no longer in flight (superseded, reset or closed) are dropped.
    pub fn apply_backfill(
        &mut self,
        request: &BackfillRequest,
        mut bars: Vec<RolledBar>,
    ) -> Option<BackfillRequest> {
        if self.closed || !self.is_in_flight(request) {
            debug!(id = request.id, "dropping abandoned backfill result");
            return None;
        }
        bars.sort_by_key(|bar| bar.seq);
        let fetched_to = bars
            .last()
            .map_or(request.after_seq, |bar| bar.seq.max(request.after_seq));
        let answered_to = request.up_to_seq.unwrap_or(fetched_to);

        let mut accepted = Vec::new();
        let state = self.keys.get_mut(&request.key)?;
        state.in_flight = None;

        for bar in bars {
            if bar.seq > answered_to {
                state.pending.entry(bar.seq).or_insert(bar);
                continue;
            }
            match state.tracker.check(bar.seq) {
                SeqCheck::Duplicate => {}
                SeqCheck::Accept => accepted.push(Self::accept(state, bar)),
                SeqCheck::Gap { .. } => {
                    state.pending.entry(bar.seq).or_insert(bar);
                }
            }
        }

        let mut skipped = 0;
        let mut follow_up = None;
        while let Some(seq) = state.pending.keys().next().copied() {
            match state.tracker.check(seq) {
                SeqCheck::Duplicate => {
                    state.pending.remove(&seq);
                    continue;
                }
                SeqCheck::Accept => {}
                // The server was asked for this range and has nothing more to give
                SeqCheck::Gap { expected, received } if received - 1 <= answered_to => {
                    skipped += received - expected;
                }
                SeqCheck::Gap { expected, received } => {
                    self.next_request += 1;
                    state.in_flight = Some(self.next_request);
                    follow_up = Some((
                        BackfillRequest {
                            id: self.next_request,
                            key: request.key.clone(),
                            after_seq: state.tracker.last_seq(),
                            up_to_seq: Some(received - 1),
                        },
                        expected,
                        received,
                    ));
                    break;
                }
            }
            if let Some(bar) = state.pending.remove(&seq) {
                accepted.push(Self::accept(state, bar));
            }
        }
        if skipped > 0 {
            warn!(
                symbol = %request.key.symbol,
                timeframe = %request.key.timeframe,
                skipped,
                "history has no bars for part of the requested range, continuing past it"
            );
        }

        let last_seq = state.tracker.last_seq();
        let queued = state.pending.len();
        info!(
            symbol = %request.key.symbol,
            timeframe = %request.key.timeframe,
            applied = accepted.len(),
            last_seq,
            queued,
            "backfill applied"
        );

        for bar in accepted {
            self.notify(&ConsumerEvent::Bar(bar));
        }
        self.persist(&request.key, last_seq);

        if let Some((next, expected, received)) = follow_up {
            warn!(
                symbol = %request.key.symbol,
                timeframe = %request.key.timeframe,
                expected,
                received,
                "gap behind backfill, requesting more history"
            );
            self.notify(&ConsumerEvent::Gap {
                key: request.key.clone(),
                expected,
                received,
            });
            self.set_status(ConnectionStatus::ReplayingGap);
            return Some(next);
        }
        if !self.keys.values().any(|state| state.in_flight.is_some()) {
            self.set_status(ConnectionStatus::Live);
        }
        None
    }

    /// The fetch for `request` failed; queued bars are dropped and the stream moves to `Error`
    /// so the reconnect loop recovers it.
    pub fn backfill_failed(&mut self, request: &BackfillRequest, reason: &str) {
        if self.closed || !self.is_in_flight(request) {
            return;
        }
        if let Some(state) = self.keys.get_mut(&request.key) {
            state.in_flight = None;
            state.pending.clear();
        }
        warn!(
            symbol = %request.key.symbol,
            timeframe = %request.key.timeframe,
            after_seq = request.after_seq,
            %reason,
            "backfill failed"
        );
        self.set_status(ConnectionStatus::Error);
    }

    /// Tear down: detach every listener and drop all queued work. Nothing is delivered afterwards.
    pub fn close(&mut self) {
        self.closed = true;
        self.listeners.clear();
        for state in self.keys.values_mut() {
            state.pending.clear();
            state.in_flight = None;
        }
    }

    fn on_bar(&mut self, bar: RolledBar) -> Option<BackfillRequest> {
        let key = StreamKey::of(&bar);
        let state = self.keys.entry(key.clone()).or_default();

        if state.in_flight.is_some() {
            if bar.seq > state.tracker.last_seq() {
                state.pending.entry(bar.seq).or_insert(bar);
            }
            return None;
        }

        match state.tracker.check(bar.seq) {
            SeqCheck::Duplicate => {
                debug!(
                    symbol = %key.symbol,
                    timeframe = %key.timeframe,
                    seq = bar.seq,
                    last_seq = state.tracker.last_seq(),
                    "dropping duplicate bar"
                );
                None
            }
            SeqCheck::Accept => {
                let bar = Self::accept(state, bar);
                let last_seq = bar.seq;
                self.notify(&ConsumerEvent::Bar(bar));
                self.persist(&key, last_seq);
                self.set_status(ConnectionStatus::Live);
                None
            }
            SeqCheck::Gap { expected, received } => {
                warn!(
                    symbol = %key.symbol,
                    timeframe = %key.timeframe,
                    expected,
                    received,
                    "gap detected"
                );
                let after_seq = state.tracker.last_seq();
                state.pending.insert(bar.seq, bar);
                self.next_request += 1;
                state.in_flight = Some(self.next_request);
                let request = BackfillRequest {
                    id: self.next_request,
                    key: key.clone(),
                    after_seq,
                    up_to_seq: Some(received - 1),
                };

                self.notify(&ConsumerEvent::Gap {
                    key,
                    expected,
                    received,
                });
                self.set_status(ConnectionStatus::ReplayingGap);
                Some(request)
            }
        }
    }

    fn on_reset(&mut self, reset: ResetPayload) {
        let key = StreamKey::new(&reset.symbol, reset.timeframe);
        let state = self.keys.entry(key.clone()).or_default();
        state.tracker = SequenceTracker::new(reset.seq);
        state.pending.clear();
        state.in_flight = None;
        state.last_bar_end = reset.bars.last().map_or(0, |bar| bar.bar_end);

        info!(
            symbol = %key.symbol,
            timeframe = %key.timeframe,
            seq = reset.seq,
            bars = reset.bars.len(),
            "timeframe reset"
        );
        let seq = reset.seq;
        self.notify(&ConsumerEvent::Reset(reset));
        self.persist(&key, seq);
        self.set_status(ConnectionStatus::Live);
    }

    fn on_epoch(&mut self, epoch: Epoch) {
        let previous = self.epoch.as_ref().map(|known| known.epoch_id.clone());
        if previous.as_ref() == Some(&epoch.epoch_id) {
            return;
        }

        if previous.is_some() {
            info!(
                previous = ?previous,
                current = %epoch.epoch_id,
                "upstream epoch changed, resetting sequence tracking"
            );
        }
        for (key, state) in self.keys.iter_mut() {
            state.pending.clear();
            state.in_flight = None;
            state.last_bar_end = 0;
            let resumed = self.store.as_ref().and_then(|store| {
                store.load(&StateKey::new(&key.symbol, key.timeframe, &epoch.epoch_id))
            });
            state.tracker = SequenceTracker::new(resumed.unwrap_or(0));
        }

        let current = epoch.epoch_id.clone();
        self.epoch = Some(epoch);
        self.notify(&ConsumerEvent::EpochChanged { previous, current });
    }

    fn accept(state: &mut KeyState, bar: RolledBar) -> RolledBar {
        state.tracker.advance(bar.seq);
        state.last_bar_end = state.last_bar_end.max(bar.bar_end);
        bar
    }

    fn is_in_flight(&self, request: &BackfillRequest) -> bool {
        self.keys
            .get(&request.key)
            .is_some_and(|state| state.in_flight == Some(request.id))
    }

    fn persist(&self, key: &StreamKey, last_seq: u64) {
        let (Some(store), Some(epoch)) = (&self.store, &self.epoch) else {
            return;
        };
        if let Err(error) = store.save(
            &StateKey::new(&key.symbol, key.timeframe, &epoch.epoch_id),
            last_seq,
        ) {
            warn!(symbol = %key.symbol, ?error, "failed to persist stream state");
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!(from = ?self.status, to = ?status, "stream status changed");
            self.status = status;
            self.notify(&ConsumerEvent::Status(status));
        }
    }

    fn notify(&mut self, event: &ConsumerEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }
}
