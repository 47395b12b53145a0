//! Server-side pipeline wiring the 1-minute feed to every derived view.
//!
//! A closed 1-minute bar flows: [`Bar1mBuffer::append`] -> [`RollupCache::invalidate`] ->
//! broadcast 1m `bar` -> [`TimeframeSwitchCoordinator::on_bar_close`].

use crate::{
    bar::{Bar1m, Epoch, RolledBar, Tick},
    buffer::{Bar1mBuffer, DEFAULT_BAR1M_CAPACITY, Reconciled},
    bus::BusEvent,
    cache::{DEFAULT_CACHE_MAX_AGE, RollupCache},
    distributor::{DEFAULT_BROADCAST_BUFFER, StreamDistributor},
    error::DataError,
    protocol::{StreamEnvelope, StreamEvent},
    switch::{DEFAULT_BACKFILL_LIMIT, SwitchOutcome, TimeframeState, TimeframeSwitchCoordinator},
    timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default number of bars returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Upper bound on the number of bars returned by a history query.
pub const MAX_HISTORY_LIMIT: usize = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub buffer_capacity: usize,
    pub broadcast_buffer: usize,
    pub backfill_limit: usize,
    pub cache_max_age: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BAR1M_CAPACITY,
            broadcast_buffer: DEFAULT_BROADCAST_BUFFER,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
        }
    }
}

/// Parameters of a history request, used both for seeding a chart and for gap backfill.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub symbol: SmolStr,
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Only bars starting strictly before this epoch ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<i64>,
    /// Only bars with `seq` strictly greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_seq: Option<u64>,
}

impl HistoryQuery {
    pub fn new(symbol: impl Into<SmolStr>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            limit: None,
            before: None,
            since_seq: None,
        }
    }

    pub fn since_seq(self, since_seq: u64) -> Self {
        Self {
            since_seq: Some(since_seq),
            ..self
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }

    /// Filter ascending `bars` by `before` / `since_seq` and apply the limit.
    ///
    /// Backfill queries (`since_seq` set) keep the oldest bars so a gap is repaired from its
    /// start; seeding queries keep the newest.
    fn select(&self, bars: impl IntoIterator<Item = RolledBar>) -> Vec<RolledBar> {
        let mut selected = bars
            .into_iter()
            .filter(|bar| self.since_seq.is_none_or(|since| bar.seq > since))
            .filter(|bar| self.before.is_none_or(|before| bar.bar_start < before))
            .collect::<Vec<_>>();

        let limit = self.limit();
        if selected.len() > limit {
            if self.since_seq.is_some() {
                selected.truncate(limit);
            } else {
                selected.drain(..selected.len() - limit);
            }
        }
        selected
    }
}

/// Keeps `user`'s timeframe sessions for a set of symbols alive while held, see
/// [`MarketDataHub::watch`].
#[derive(Debug)]
pub struct SessionWatch {
    hub: Arc<MarketDataHub>,
    user: SmolStr,
    symbols: Vec<SmolStr>,
}

impl Drop for SessionWatch {
    fn drop(&mut self) {
        for symbol in &self.symbols {
            self.hub.coordinator.detach(&self.user, symbol);
        }
    }
}

/// Owns every server-side component for one process lifetime, identified by its [`Epoch`].
#[derive(Debug)]
pub struct MarketDataHub {
    epoch: Epoch,
    config: HubConfig,
    buffer: Arc<Bar1mBuffer>,
    cache: RollupCache,
    distributor: StreamDistributor,
    coordinator: TimeframeSwitchCoordinator,
}

impl Default for MarketDataHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl MarketDataHub {
    pub fn new(config: HubConfig) -> Self {
        let buffer = Arc::new(Bar1mBuffer::new(config.buffer_capacity));
        let distributor = StreamDistributor::new(config.broadcast_buffer);
        let coordinator = TimeframeSwitchCoordinator::new(buffer.clone(), distributor.clone())
            .with_backfill_limit(config.backfill_limit);
        let epoch = Epoch::start();

        info!(epoch_id = %epoch.epoch_id, ?config, "market data hub started");

        Self {
            epoch,
            cache: RollupCache::new(config.cache_max_age),
            config,
            buffer,
            distributor,
            coordinator,
        }
    }

    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Bar1mBuffer {
        &self.buffer
    }

    pub fn cache(&self) -> &RollupCache {
        &self.cache
    }

    pub fn distributor(&self) -> &StreamDistributor {
        &self.distributor
    }

    pub fn coordinator(&self) -> &TimeframeSwitchCoordinator {
        &self.coordinator
    }

    /// Attach a stream to `user`'s sessions for `symbols`. Dropping the returned watch detaches
    /// it, and a session ends once its last stream is gone.
    pub fn watch<Iter, S>(self: &Arc<Self>, user: &str, symbols: Iter) -> SessionWatch
    where
        Iter: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        let symbols = symbols.into_iter().map(Into::into).collect::<Vec<SmolStr>>();
        for symbol in &symbols {
            self.coordinator.attach(user, symbol);
        }
        SessionWatch {
            hub: self.clone(),
            user: SmolStr::new(user),
            symbols,
        }
    }

    pub fn on_bar_close(&self, bar: Bar1m) -> Result<(), DataError> {
        self.buffer.append(bar.clone())?;
        self.cache.invalidate(&bar.symbol, None);

        self.distributor
            .publish(StreamEnvelope::broadcast(StreamEvent::Bar(RolledBar::from(&bar))));
        let derived = self.coordinator.on_bar_close(&bar);

        debug!(symbol = %bar.symbol, seq = bar.seq, derived = derived.len(), "1m bar closed");
        Ok(())
    }

    pub fn on_bar_corrected(&self, bar: Bar1m) -> Reconciled {
        let symbol = bar.symbol.clone();
        let (seq, ohlcv) = (bar.seq, bar.ohlcv);
        let reconciled = self.buffer.reconcile(bar);
        self.cache.invalidate(&symbol, None);

        match &reconciled.previous {
            Some(previous) => info!(
                %symbol,
                seq,
                previous_seq = previous.seq,
                before = ?previous.ohlcv,
                after = ?ohlcv,
                "1m bar corrected"
            ),
            None => info!(%symbol, seq, after = ?ohlcv, "1m gap filled by correction"),
        }
        reconciled
    }

    pub fn on_partial(&self, bar: Bar1m) {
        self.distributor
            .publish(StreamEnvelope::broadcast(StreamEvent::MicroBar(RolledBar::from(&bar))));
    }

    pub fn on_tick(&self, tick: Tick) {
        self.distributor
            .publish(StreamEnvelope::broadcast(StreamEvent::Tick(tick)));
    }

    pub fn handle(&self, event: BusEvent) {
        match event {
            BusEvent::BarClosed(bar) => {
                if let Err(error) = self.on_bar_close(bar) {
                    warn!(?error, "dropped 1m bar close");
                }
            }
            BusEvent::BarCorrected(bar) => {
                self.on_bar_corrected(bar);
            }
            BusEvent::Partial(bar) => self.on_partial(bar),
            BusEvent::Tick(tick) => self.on_tick(tick),
        }
    }

    /// Consume events from a reliable bus subscription until the bus is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<BusEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        info!("event bus closed, market data hub stopping");
    }

    pub fn switch_timeframe(&self, user: &str, symbol: &str, timeframe: Timeframe) -> SwitchOutcome {
        self.coordinator.switch_timeframe(user, symbol, timeframe)
    }

    /// Finalized bars for `query`, ascending by `seq`.
    ///
    /// Higher timeframes are served in the caller's live seq space when they have a session for
    /// the same timeframe, otherwise from a cached batch rollup.
    pub fn history(&self, user: &str, query: &HistoryQuery) -> Vec<RolledBar> {
        let symbol = query.symbol.as_str();

        if query.timeframe.is_base() {
            let bars = match query.since_seq {
                Some(since) => self.buffer.get_since_seq(symbol, since),
                None => self.buffer.get_recent(symbol, self.buffer.capacity()),
            };
            return query.select(bars.iter().map(RolledBar::from));
        }

        if let Some(bars) = self.coordinator.bars_since(
            user,
            symbol,
            query.timeframe,
            query.since_seq.unwrap_or(0),
        ) {
            return query.select(bars);
        }

        let rolled = self.cache.get_or_compute(
            symbol,
            query.timeframe,
            self.buffer.current_seq(symbol),
            || {
                let recent = self.buffer.get_recent(symbol, self.config.backfill_limit);
                TimeframeState::from_history(query.timeframe, &recent)
                    .0
                    .rolled_bars
            },
        );
        query.select(rolled.iter().cloned())
    }

    /// Events a new stream connection replays before going live: finalized bars after
    /// `since_seq` for `symbol` in `timeframe`.
    ///
    /// Higher timeframes start a live session for `user` when none exists, which publishes its
    /// own `bar:reset`.
    pub fn replay(
        &self,
        user: &str,
        symbol: &str,
        timeframe: Timeframe,
        since_seq: u64,
    ) -> Vec<StreamEvent> {
        if timeframe.is_base() {
            return self
                .buffer
                .get_since_seq(symbol, since_seq)
                .iter()
                .map(|bar| StreamEvent::Bar(RolledBar::from(bar)))
                .collect();
        }

        if let Some(outcome) = self.coordinator.ensure_live(user, symbol, timeframe) {
            debug!(%user, %symbol, %timeframe, ?outcome, "stream opened a timeframe session");
        }
        self.coordinator
            .bars_since(user, symbol, timeframe, since_seq)
            .unwrap_or_default()
            .into_iter()
            .map(StreamEvent::Bar)
            .collect()
    }
}
