//! Per `(user, symbol)` timeframe sessions derived from the shared 1-minute timeline.
//!
//! Switching a timeframe never touches the 1-minute feed: it rebuilds a [`TimeframeState`] from
//! recent 1-minute history, installs it with one map insertion, and emits a full-replace
//! `bar:reset`. Every later 1-minute close is dispatched to each live session by
//! [`TimeframeSwitchCoordinator::on_bar_close`].

use crate::{
    bar::{Bar1m, RolledBar},
    buffer::Bar1mSource,
    distributor::StreamDistributor,
    error::DataError,
    protocol::{ResetPayload, StreamEnvelope, StreamEvent},
    rollup::{apply_1m_close_to_rollup, is_bucket_complete, rollup_from_1m, seed_bucket},
    timeframe::Timeframe,
};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of recent 1-minute bars pulled when building a new timeframe.
pub const DEFAULT_BACKFILL_LIMIT: usize = 500;

/// Default number of finalized bars retained per session.
pub const DEFAULT_MAX_ROLLED_BARS: usize = 2_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPhase {
    #[default]
    Idle,
    Switching,
    Live,
}

/// Rolled view of one symbol in one timeframe.
///
/// `rolled_bars` hold finalized bars with `seq` `1..=seq`. `current_bar` is the open bucket and
/// carries the `seq` it will be finalized with.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeframeState {
    pub timeframe: Timeframe,
    pub rolled_bars: Vec<RolledBar>,
    pub current_bar: Option<RolledBar>,
    pub seq: u64,
    pub is_live: bool,
    /// Seq of the last 1-minute bar folded into this state.
    pub last_1m_seq: u64,
}

impl TimeframeState {
    /// Build a state from ascending 1-minute history, returning it with the number of buckets
    /// the history rolled up into.
    pub fn from_history(timeframe: Timeframe, bars_1m: &[Bar1m]) -> (Self, usize) {
        let last_1m_seq = bars_1m.last().map_or(0, |bar| bar.seq);

        // The 1-minute timeframe shares the upstream seq space
        if timeframe.is_base() {
            let rolled_bars = bars_1m.iter().map(RolledBar::from).collect::<Vec<_>>();
            let count = rolled_bars.len();
            return (
                Self {
                    timeframe,
                    rolled_bars,
                    current_bar: None,
                    seq: last_1m_seq,
                    is_live: true,
                    last_1m_seq,
                },
                count,
            );
        }

        let mut rolled_bars = rollup_from_1m(bars_1m, timeframe);
        let count = rolled_bars.len();

        let trailing_open = match (rolled_bars.last(), bars_1m.last()) {
            (Some(trailing), Some(latest)) => !is_bucket_complete(trailing, latest),
            _ => false,
        };
        let current_bar = if trailing_open {
            rolled_bars.pop()
        } else {
            None
        };

        let seq = rolled_bars.len() as u64;
        (
            Self {
                timeframe,
                rolled_bars,
                current_bar,
                seq,
                is_live: true,
                last_1m_seq,
            },
            count,
        )
    }

    /// Fold a closed 1-minute bar into the state, returning the events it produced.
    ///
    /// Re-delivered or stale closes are ignored.
    pub fn apply_close(&mut self, symbol: &str, closed: &Bar1m) -> Vec<StreamEvent> {
        if closed.seq <= self.last_1m_seq {
            debug!(
                %symbol,
                seq = closed.seq,
                last_1m_seq = self.last_1m_seq,
                "ignoring re-delivered 1m close"
            );
            return Vec::new();
        }
        if self
            .current_bar
            .as_ref()
            .is_some_and(|current| closed.bar_start < current.bar_start)
        {
            warn!(
                %symbol,
                seq = closed.seq,
                timeframe = %self.timeframe,
                "ignoring 1m close older than open bucket"
            );
            return Vec::new();
        }
        self.last_1m_seq = closed.seq;

        if self.timeframe.is_base() {
            self.seq = closed.seq;
            self.rolled_bars.push(RolledBar::from(closed));
            return Vec::new();
        }

        match apply_1m_close_to_rollup(symbol, self.timeframe, closed, self.current_bar.as_ref()) {
            Some(mut next) => {
                next.seq = self.seq + 1;
                self.current_bar = Some(next.clone());
                vec![StreamEvent::MicroBar(next)]
            }
            None => {
                let mut events = Vec::with_capacity(2);
                if let Some(mut finalized) = self.current_bar.take() {
                    self.seq += 1;
                    finalized.seq = self.seq;
                    self.rolled_bars.push(finalized.clone());
                    events.push(StreamEvent::Bar(finalized));
                }

                let fresh = seed_bucket(symbol, self.timeframe, closed, self.seq + 1);
                self.current_bar = Some(fresh.clone());
                events.push(StreamEvent::MicroBar(fresh));
                events
            }
        }
    }

    /// Finalized bars with `seq > after_seq`, ascending.
    pub fn bars_since(&self, after_seq: u64) -> Vec<RolledBar> {
        let start = self.rolled_bars.partition_point(|bar| bar.seq <= after_seq);
        self.rolled_bars[start..].to_vec()
    }

    pub fn reset_payload(&self, symbol: &str) -> ResetPayload {
        ResetPayload {
            symbol: SmolStr::new(symbol),
            timeframe: self.timeframe,
            seq: self.seq,
            bars: self.rolled_bars.clone(),
            current: self.current_bar.clone(),
        }
    }

    fn trim(&mut self, max_rolled_bars: usize) {
        if self.rolled_bars.len() > max_rolled_bars {
            let excess = self.rolled_bars.len() - max_rolled_bars;
            self.rolled_bars.drain(..excess);
        }
    }
}

/// Result of [`TimeframeSwitchCoordinator::switch_timeframe`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchOutcome {
    pub ok: bool,
    pub bars_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SwitchOutcome {
    pub fn success(bars_count: usize) -> Self {
        Self {
            ok: true,
            bars_count,
            error: None,
        }
    }

    pub fn failure(error: &DataError) -> Self {
        Self {
            ok: false,
            bars_count: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Display)]
#[display("{user}/{symbol}")]
pub struct SessionKey {
    pub user: SmolStr,
    pub symbol: SmolStr,
}

impl SessionKey {
    pub fn new(user: &str, symbol: &str) -> Self {
        Self {
            user: SmolStr::new(user),
            symbol: SmolStr::new(symbol),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub phase: SwitchPhase,
    pub state: TimeframeState,
}

/// Registry of every `(user, symbol)` session and the state machine driving it.
pub struct TimeframeSwitchCoordinator {
    source: Arc<dyn Bar1mSource>,
    distributor: StreamDistributor,
    backfill_limit: usize,
    max_rolled_bars: usize,
    sessions: RwLock<FnvHashMap<SessionKey, Session>>,
    /// Open streams per session, the session ends when its last stream detaches.
    watchers: Mutex<FnvHashMap<SessionKey, usize>>,
}

impl std::fmt::Debug for TimeframeSwitchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeframeSwitchCoordinator")
            .field("backfill_limit", &self.backfill_limit)
            .field("max_rolled_bars", &self.max_rolled_bars)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

impl TimeframeSwitchCoordinator {
    pub fn new(source: Arc<dyn Bar1mSource>, distributor: StreamDistributor) -> Self {
        Self {
            source,
            distributor,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            max_rolled_bars: DEFAULT_MAX_ROLLED_BARS,
            sessions: RwLock::new(FnvHashMap::default()),
            watchers: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn with_backfill_limit(self, backfill_limit: usize) -> Self {
        Self {
            backfill_limit,
            ..self
        }
    }

    pub fn with_max_rolled_bars(self, max_rolled_bars: usize) -> Self {
        Self {
            max_rolled_bars: max_rolled_bars.max(1),
            ..self
        }
    }

    /// Switch `user`'s view of `symbol` to `timeframe`.
    ///
    /// On failure the prior session keeps its timeframe and bars, and is caught up with every
    /// close it missed while the switch was in progress.
    pub fn switch_timeframe(&self, user: &str, symbol: &str, timeframe: Timeframe) -> SwitchOutcome {
        let key = SessionKey::new(user, symbol);

        let prior = self.sessions.write().get_mut(&key).map(|session| {
            let prior = (session.phase, session.state.is_live);
            session.phase = SwitchPhase::Switching;
            session.state.is_live = false;
            prior
        });

        match self.build_and_install(&key, timeframe) {
            Ok(bars_count) => {
                info!(%user, %symbol, %timeframe, bars_count, "timeframe switched");
                SwitchOutcome::success(bars_count)
            }
            Err(error) => {
                warn!(%user, %symbol, %timeframe, ?error, "timeframe switch failed");
                if let Some((phase, is_live)) = prior {
                    self.restore(&key, phase, is_live);
                }
                SwitchOutcome::failure(&error)
            }
        }
    }

    /// Switch only if `user` has no live session for `symbol` in `timeframe` yet.
    pub fn ensure_live(&self, user: &str, symbol: &str, timeframe: Timeframe) -> Option<SwitchOutcome> {
        let live = self
            .sessions
            .read()
            .get(&SessionKey::new(user, symbol))
            .is_some_and(|session| {
                session.phase == SwitchPhase::Live && session.state.timeframe == timeframe
            });

        (!live).then(|| self.switch_timeframe(user, symbol, timeframe))
    }

    /// Drive every live session of the bar's symbol with a closed 1-minute bar, publishing and
    /// returning the resulting envelopes.
    pub fn on_bar_close(&self, closed: &Bar1m) -> Vec<StreamEnvelope> {
        let mut sessions = self.sessions.write();
        let mut envelopes = Vec::new();

        for (key, session) in sessions
            .iter_mut()
            .filter(|(key, session)| key.symbol == closed.symbol && session.phase == SwitchPhase::Live)
        {
            for event in session.state.apply_close(&key.symbol, closed) {
                let envelope = StreamEnvelope::for_user(key.user.clone(), event);
                self.distributor.publish(envelope.clone());
                envelopes.push(envelope);
            }
            session.state.trim(self.max_rolled_bars);
        }

        envelopes
    }

    pub fn snapshot(&self, user: &str, symbol: &str) -> Option<TimeframeState> {
        self.sessions
            .read()
            .get(&SessionKey::new(user, symbol))
            .map(|session| session.state.clone())
    }

    pub fn phase(&self, user: &str, symbol: &str) -> SwitchPhase {
        self.sessions
            .read()
            .get(&SessionKey::new(user, symbol))
            .map_or(SwitchPhase::Idle, |session| session.phase)
    }

    /// Finalized bars after `after_seq` when `user`'s session for `symbol` is in `timeframe`.
    pub fn bars_since(
        &self,
        user: &str,
        symbol: &str,
        timeframe: Timeframe,
        after_seq: u64,
    ) -> Option<Vec<RolledBar>> {
        self.sessions
            .read()
            .get(&SessionKey::new(user, symbol))
            .filter(|session| session.state.timeframe == timeframe)
            .map(|session| session.state.bars_since(after_seq))
    }

    pub fn end_session(&self, user: &str, symbol: &str) -> bool {
        self.sessions
            .write()
            .remove(&SessionKey::new(user, symbol))
            .is_some()
    }

    /// Register an open stream on `user`'s session for `symbol`.
    pub fn attach(&self, user: &str, symbol: &str) {
        *self
            .watchers
            .lock()
            .entry(SessionKey::new(user, symbol))
            .or_default() += 1;
    }

    /// Release a stream registered with [`attach`](Self::attach), ending the session once no
    /// stream is left on it. Returns whether the session ended.
    pub fn detach(&self, user: &str, symbol: &str) -> bool {
        let key = SessionKey::new(user, symbol);
        // Held while ending the session so a concurrent attach cannot lose its session
        let mut watchers = self.watchers.lock();
        match watchers.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                watchers.remove(&key);
                let ended = self.sessions.write().remove(&key).is_some();
                if ended {
                    debug!(session = %key, "last stream detached, timeframe session ended");
                }
                ended
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn build_and_install(&self, key: &SessionKey, timeframe: Timeframe) -> Result<usize, DataError> {
        let history = match self.source.recent(&key.symbol, self.backfill_limit) {
            Ok(history) => history,
            Err(error) if error.is_recoverable() => {
                debug!(symbol = %key.symbol, ?error, "no 1m history yet, starting empty");
                Vec::new()
            }
            Err(error) => {
                return Err(DataError::Switch {
                    symbol: key.symbol.clone(),
                    reason: error.to_string(),
                });
            }
        };
        let (mut state, bars_count) = TimeframeState::from_history(timeframe, &history);

        let mut sessions = self.sessions.write();

        // Closes that landed between the history read and acquiring the lock
        match self.source.since_seq(&key.symbol, state.last_1m_seq) {
            Ok(missed) => {
                for closed in &missed {
                    state.apply_close(&key.symbol, closed);
                }
            }
            Err(error) if error.is_recoverable() => {
                debug!(symbol = %key.symbol, ?error, "no 1m closes to catch up");
            }
            Err(error) => {
                return Err(DataError::Switch {
                    symbol: key.symbol.clone(),
                    reason: format!("catching up 1m closes: {error}"),
                });
            }
        }
        state.trim(self.max_rolled_bars);

        let reset = state.reset_payload(&key.symbol);
        sessions.insert(
            key.clone(),
            Session {
                phase: SwitchPhase::Live,
                state,
            },
        );
        self.distributor.publish(StreamEnvelope::for_user(
            key.user.clone(),
            StreamEvent::Reset(reset),
        ));

        Ok(bars_count)
    }

    /// Put a session back after a failed switch and fold in the closes skipped while it was not
    /// live, publishing the events they produce.
    fn restore(&self, key: &SessionKey, phase: SwitchPhase, is_live: bool) {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(key) else {
            return;
        };
        session.phase = phase;
        session.state.is_live = is_live;
        if phase != SwitchPhase::Live {
            return;
        }

        let missed = match self.source.since_seq(&key.symbol, session.state.last_1m_seq) {
            Ok(missed) => missed,
            Err(error) => {
                warn!(session = %key, ?error, "failed to catch up 1m closes after failed switch");
                return;
            }
        };
        for closed in &missed {
            for event in session.state.apply_close(&key.symbol, closed) {
                self.distributor
                    .publish(StreamEnvelope::for_user(key.user.clone(), event));
            }
        }
        session.state.trim(self.max_rolled_bars);
        if !missed.is_empty() {
            debug!(session = %key, caught_up = missed.len(), "restored session after failed switch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bar::{BAR_1M_MS, Ohlcv},
        buffer::Bar1mBuffer,
    };

    // 2023-11-14T22:15:00Z, aligned to 15 minutes
    const T0: i64 = 1_700_000_100_000;

    fn minute(seq: u64) -> Bar1m {
        let base = 100.0 + seq as f64;
        Bar1m::new(
            "SPY",
            seq,
            T0 + (seq as i64 - 1) * BAR_1M_MS,
            Ohlcv::new(base, base + 2.0, base - 1.0, base + 0.5, 10.0 * seq as f64),
        )
    }

    fn five() -> Timeframe {
        Timeframe::from_minutes(5).unwrap()
    }

    fn coordinator(count: u64) -> (Arc<Bar1mBuffer>, StreamDistributor, TimeframeSwitchCoordinator) {
        let buffer = Arc::new(Bar1mBuffer::default());
        for seq in 1..=count {
            buffer.append(minute(seq)).unwrap();
        }
        let distributor = StreamDistributor::new(64);
        let coordinator = TimeframeSwitchCoordinator::new(buffer.clone(), distributor.clone());
        (buffer, distributor, coordinator)
    }

    struct FailingSource;

    impl Bar1mSource for FailingSource {
        fn recent(&self, _: &str, _: usize) -> Result<Vec<Bar1m>, DataError> {
            Err(DataError::Decode {
                event: "1m".to_string(),
                reason: "storage offline".to_string(),
            })
        }

        fn since_seq(&self, symbol: &str, _: u64) -> Result<Vec<Bar1m>, DataError> {
            self.recent(symbol, 0)
        }
    }

    /// History reads succeed, catch-up reads fail.
    struct NoCatchUpSource(Arc<Bar1mBuffer>);

    impl Bar1mSource for NoCatchUpSource {
        fn recent(&self, symbol: &str, n: usize) -> Result<Vec<Bar1m>, DataError> {
            self.0.recent(symbol, n)
        }

        fn since_seq(&self, _: &str, _: u64) -> Result<Vec<Bar1m>, DataError> {
            Err(DataError::Decode {
                event: "1m".to_string(),
                reason: "storage offline".to_string(),
            })
        }
    }

    /// A close lands in storage while the history read is in progress, then the read fails.
    struct CloseDuringReadSource {
        buffer: Arc<Bar1mBuffer>,
        landed: Vec<Bar1m>,
    }

    impl Bar1mSource for CloseDuringReadSource {
        fn recent(&self, _: &str, _: usize) -> Result<Vec<Bar1m>, DataError> {
            for bar in &self.landed {
                self.buffer.append(bar.clone())?;
            }
            Err(DataError::Decode {
                event: "1m".to_string(),
                reason: "read interrupted".to_string(),
            })
        }

        fn since_seq(&self, symbol: &str, after_seq: u64) -> Result<Vec<Bar1m>, DataError> {
            self.buffer.since_seq(symbol, after_seq)
        }
    }

    fn rewired(
        good: &TimeframeSwitchCoordinator,
        source: Arc<dyn Bar1mSource>,
        distributor: StreamDistributor,
    ) -> TimeframeSwitchCoordinator {
        TimeframeSwitchCoordinator {
            source,
            distributor,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            max_rolled_bars: DEFAULT_MAX_ROLLED_BARS,
            sessions: RwLock::new(good.sessions.read().clone()),
            watchers: Mutex::new(FnvHashMap::default()),
        }
    }

    #[test]
    fn test_switch_ten_minutes_to_two_five_minute_bars() {
        let (_, distributor, coordinator) = coordinator(10);
        let mut rx = distributor.subscribe();

        let outcome = coordinator.switch_timeframe("alice", "SPY", five());

        assert_eq!(outcome, SwitchOutcome::success(2));
        let state = coordinator.snapshot("alice", "SPY").unwrap();
        assert_eq!(state.rolled_bars.len(), 2);
        assert_eq!(state.seq, 2);
        assert!(state.current_bar.is_none());
        assert!(state.is_live);

        let bars = (1..=10).map(minute).collect::<Vec<_>>();
        for (rolled, group) in state.rolled_bars.iter().zip(bars.chunks(5)) {
            assert_eq!(rolled.ohlcv.open, group[0].ohlcv.open);
            assert_eq!(rolled.ohlcv.high, group[4].ohlcv.high);
            assert_eq!(rolled.ohlcv.low, group[0].ohlcv.low);
            assert_eq!(rolled.ohlcv.close, group[4].ohlcv.close);
            assert_eq!(
                rolled.ohlcv.volume,
                group.iter().map(|bar| bar.ohlcv.volume).sum::<f64>()
            );
        }

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.user.as_deref(), Some("alice"));
        match envelope.event {
            StreamEvent::Reset(reset) => {
                assert_eq!(reset.bars, state.rolled_bars);
                assert_eq!(reset.seq, 2);
            }
            other => panic!("expected reset, got {other:?}"),
        }
    }

    #[test]
    fn test_switch_with_no_history_proceeds_empty() {
        let (_, _, coordinator) = coordinator(0);

        let outcome = coordinator.switch_timeframe("alice", "SPY", five());

        assert_eq!(outcome, SwitchOutcome::success(0));
        assert_eq!(coordinator.phase("alice", "SPY"), SwitchPhase::Live);
    }

    #[test]
    fn test_trailing_incomplete_bucket_becomes_current_bar() {
        let (_, _, coordinator) = coordinator(7);

        let outcome = coordinator.switch_timeframe("alice", "SPY", five());

        assert_eq!(outcome.bars_count, 2);
        let state = coordinator.snapshot("alice", "SPY").unwrap();
        assert_eq!(state.seq, 1);
        let current = state.current_bar.unwrap();
        assert_eq!(current.bar_start, T0 + 5 * BAR_1M_MS);
        assert_eq!(current.seq, 2);
        assert_eq!(current.ohlcv.volume, 60.0 + 70.0);
    }

    #[test]
    fn test_live_closes_emit_microbars_then_sequenced_bar() {
        let (buffer, distributor, coordinator) = coordinator(10);
        coordinator.switch_timeframe("alice", "SPY", five());
        let mut rx = distributor.subscribe();

        let mut emitted = Vec::new();
        for seq in 11..=16 {
            buffer.append(minute(seq)).unwrap();
            emitted.extend(coordinator.on_bar_close(&minute(seq)));
        }

        let names = emitted
            .iter()
            .map(|envelope| envelope.event.name())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["microbar", "microbar", "microbar", "microbar", "microbar", "bar", "microbar"]
        );
        let finalized = emitted
            .iter()
            .find_map(|envelope| match &envelope.event {
                StreamEvent::Bar(bar) => Some(bar.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(finalized.seq, 3);
        assert_eq!(finalized.bar_start, T0 + 10 * BAR_1M_MS);
        assert_eq!(finalized.ohlcv.close, minute(15).ohlcv.close);

        let state = coordinator.snapshot("alice", "SPY").unwrap();
        assert_eq!(state.seq, 3);
        assert_eq!(state.current_bar.map(|bar| bar.seq), Some(4));
        assert_eq!(rx.len(), emitted.len());
    }

    #[test]
    fn test_redelivered_close_is_ignored() {
        let (buffer, _, coordinator) = coordinator(10);
        coordinator.switch_timeframe("alice", "SPY", five());
        buffer.append(minute(11)).unwrap();

        assert_eq!(coordinator.on_bar_close(&minute(11)).len(), 1);
        assert!(coordinator.on_bar_close(&minute(11)).is_empty());
        assert!(coordinator.on_bar_close(&minute(3)).is_empty());
    }

    #[test]
    fn test_failed_switch_leaves_prior_state_untouched() {
        let (_, distributor, good) = coordinator(10);
        good.switch_timeframe("alice", "SPY", five());
        let before = good.snapshot("alice", "SPY").unwrap();

        // Same registry, broken storage
        let broken = rewired(&good, Arc::new(FailingSource), distributor);

        let outcome = broken.switch_timeframe("alice", "SPY", Timeframe::from_minutes(15).unwrap());

        assert!(!outcome.ok);
        assert_eq!(outcome.bars_count, 0);
        assert!(outcome.error.is_some());
        assert_eq!(broken.snapshot("alice", "SPY").unwrap(), before);
        assert_eq!(broken.phase("alice", "SPY"), SwitchPhase::Live);
    }

    #[test]
    fn test_failed_catch_up_fails_the_switch() {
        let (buffer, distributor, good) = coordinator(10);
        good.switch_timeframe("alice", "SPY", five());
        let before = good.snapshot("alice", "SPY").unwrap();
        let mut rx = distributor.subscribe();

        let broken = rewired(&good, Arc::new(NoCatchUpSource(buffer)), distributor);
        let outcome = broken.switch_timeframe("alice", "SPY", Timeframe::from_minutes(15).unwrap());

        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("catching up"));
        assert_eq!(broken.snapshot("alice", "SPY").unwrap(), before);
        assert_eq!(broken.phase("alice", "SPY"), SwitchPhase::Live);
        // No reset went out for the abandoned timeframe
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_switch_catches_up_skipped_closes() {
        let (buffer, distributor, good) = coordinator(10);
        good.switch_timeframe("alice", "SPY", five());
        let mut rx = distributor.subscribe();

        let broken = rewired(
            &good,
            Arc::new(CloseDuringReadSource {
                buffer: buffer.clone(),
                landed: vec![minute(11), minute(12)],
            }),
            distributor,
        );
        let outcome = broken.switch_timeframe("alice", "SPY", Timeframe::from_minutes(15).unwrap());

        assert!(!outcome.ok);
        let state = broken.snapshot("alice", "SPY").unwrap();
        assert_eq!(state.timeframe, five());
        assert_eq!(state.last_1m_seq, 12);
        assert_eq!(state.seq, 2);
        let current = state.current_bar.unwrap();
        assert_eq!(current.bar_start, T0 + 10 * BAR_1M_MS);
        assert_eq!(current.ohlcv.volume, 110.0 + 120.0);

        let microbars = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|envelope| matches!(envelope.event, StreamEvent::MicroBar(_)))
            .count();
        assert_eq!(microbars, 2);

        // Live closes pick up where the catch-up stopped
        buffer.append(minute(13)).unwrap();
        assert_eq!(broken.on_bar_close(&minute(13)).len(), 1);
        assert!(broken.on_bar_close(&minute(12)).is_empty());
    }

    #[test]
    fn test_session_ends_with_last_stream() {
        let (_, _, coordinator) = coordinator(10);

        coordinator.attach("alice", "SPY");
        coordinator.attach("alice", "SPY");
        coordinator.ensure_live("alice", "SPY", five());
        coordinator.attach("bob", "SPY");
        coordinator.ensure_live("bob", "SPY", five());
        assert_eq!(coordinator.session_count(), 2);

        assert!(!coordinator.detach("alice", "SPY"));
        assert_eq!(coordinator.session_count(), 2);
        assert!(coordinator.detach("alice", "SPY"));
        assert_eq!(coordinator.phase("alice", "SPY"), SwitchPhase::Idle);
        assert!(coordinator.detach("bob", "SPY"));
        assert_eq!(coordinator.session_count(), 0);

        // Unknown or already released
        assert!(!coordinator.detach("alice", "SPY"));
        assert!(!coordinator.detach("carol", "QQQ"));

        // A fresh stream rebuilds the session
        coordinator.attach("alice", "SPY");
        assert!(coordinator.ensure_live("alice", "SPY", five()).is_some());
        assert_eq!(coordinator.session_count(), 1);
    }

    #[test]
    fn test_repeated_switches_keep_one_session_per_key() {
        let (buffer, _, coordinator) = coordinator(10);

        for minutes in [5, 15, 1, 5] {
            coordinator.switch_timeframe("alice", "SPY", Timeframe::from_minutes(minutes).unwrap());
        }
        coordinator.switch_timeframe("bob", "SPY", five());
        buffer.append(minute(11)).unwrap();

        assert_eq!(coordinator.session_count(), 2);
        // One microbar per user, never one per historical switch
        assert_eq!(coordinator.on_bar_close(&minute(11)).len(), 2);
        assert!(coordinator.end_session("bob", "SPY"));
        assert_eq!(coordinator.phase("bob", "SPY"), SwitchPhase::Idle);
    }

    #[test]
    fn test_base_timeframe_mirrors_1m_seq() {
        let (buffer, _, coordinator) = coordinator(10);
        coordinator.switch_timeframe("alice", "SPY", Timeframe::M1);
        buffer.append(minute(11)).unwrap();

        assert!(coordinator.on_bar_close(&minute(11)).is_empty());
        let state = coordinator.snapshot("alice", "SPY").unwrap();
        assert_eq!(state.seq, 11);
        assert_eq!(
            coordinator
                .bars_since("alice", "SPY", Timeframe::M1, 9)
                .unwrap()
                .iter()
                .map(|bar| bar.seq)
                .collect::<Vec<_>>(),
            vec![10, 11]
        );
        assert!(coordinator.bars_since("alice", "SPY", five(), 0).is_none());
    }

    #[test]
    fn test_ensure_live_only_switches_when_needed() {
        let (_, _, coordinator) = coordinator(10);

        assert!(coordinator.ensure_live("alice", "SPY", five()).is_some());
        assert!(coordinator.ensure_live("alice", "SPY", five()).is_none());
        assert!(
            coordinator
                .ensure_live("alice", "SPY", Timeframe::from_minutes(15).unwrap())
                .is_some()
        );
    }

    #[test]
    fn test_switch_outcome_serialises_camel_case() {
        let json = serde_json::to_string(&SwitchOutcome::success(3)).unwrap();
        assert_eq!(json, r#"{"ok":true,"barsCount":3}"#);
    }
}
