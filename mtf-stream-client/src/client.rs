//! Async driver around [`StreamConsumer`]: owns the SSE connection, reconnects with backoff and
//! runs backfill fetches off the event loop.

use crate::{
    api::{HistorySource, HttpApi, USER_HEADER},
    config::StreamClientConfig,
    consumer::{BackfillRequest, ConsumerEvent, StreamConsumer, StreamKey},
    error::ClientError,
    sse::SseDecoder,
    store::StateStore,
    timeframe::{RollbackPolicy, TimeframeSelection},
};
use futures::StreamExt;
use mtf_data::{RolledBar, StreamEvent, SwitchOutcome, Timeframe};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

type BackfillResult = (BackfillRequest, Result<Vec<RolledBar>, ClientError>);

#[derive(Debug)]
enum Command {
    FocusRegained,
    Resubscribe(Timeframe),
}

/// Stream client for the sequenced bar stream
pub struct StreamClient {
    config: StreamClientConfig,
    api: HttpApi,
    history: Arc<dyn HistorySource>,
    store: Option<Arc<dyn StateStore>>,
    policy: RollbackPolicy,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    pub fn new(config: StreamClientConfig) -> Self {
        let api = HttpApi::new(config.clone());
        Self {
            history: Arc::new(api.clone()),
            api,
            config,
            store: None,
            policy: RollbackPolicy::default(),
        }
    }

    /// Use `history` for backfill instead of the server's history endpoint.
    pub fn with_history_source(mut self, history: Arc<dyn HistorySource>) -> Self {
        self.history = history;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start the stream client connection
    ///
    /// Returns a handle to steer the connection and a receiver for consumer events, delivered in
    /// arrival order with strictly ascending `seq` per `(symbol, timeframe)`.
    pub fn start(self) -> (StreamHandle, mpsc::UnboundedReceiver<ConsumerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(self.config.channel_buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconnects = Arc::new(AtomicU64::new(0));

        let mut consumer = match &self.store {
            Some(store) => StreamConsumer::new().with_store(store.clone()),
            None => StreamConsumer::new(),
        };
        consumer.add_listener(move |event| {
            let _ = event_tx.send(event.clone());
        });

        let task = tokio::spawn(run_stream_loop(
            StreamLoop {
                config: self.config.clone(),
                http: self.api.http().clone(),
                history: self.history,
                consumer,
                reconnects: reconnects.clone(),
            },
            command_rx,
            shutdown_rx,
        ));

        let handle = StreamHandle {
            selection: TimeframeSelection::new(self.config.timeframe, self.policy),
            api: self.api,
            commands: command_tx,
            shutdown: shutdown_tx,
            reconnects,
            task,
        };
        (handle, event_rx)
    }
}

/// Control surface of a running [`StreamClient`].
#[derive(Debug)]
pub struct StreamHandle {
    api: HttpApi,
    selection: TimeframeSelection,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    reconnects: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// The chart became visible again, fetch anything missed while it was hidden.
    pub async fn focus_regained(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::FocusRegained)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Timeframe currently displayed, including an unconfirmed request.
    pub fn timeframe(&self) -> Timeframe {
        self.selection.displayed()
    }

    /// Switch every subscribed symbol to `timeframe` and resubscribe the stream.
    pub async fn switch_timeframe(
        &mut self,
        timeframe: Timeframe,
    ) -> Result<Vec<SwitchOutcome>, ClientError> {
        if !self.selection.request(timeframe) {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(self.api.config().symbols.len());
        for symbol in &self.api.config().symbols {
            match self.api.switch_timeframe(symbol, timeframe).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => outcomes.push(SwitchOutcome {
                    ok: false,
                    bars_count: 0,
                    error: Some(error.to_string()),
                }),
            }
        }

        let rejected = outcomes.iter().find(|outcome| !outcome.ok);
        let merged = match rejected {
            Some(rejected) => rejected.clone(),
            None => SwitchOutcome::success(outcomes.iter().map(|outcome| outcome.bars_count).sum()),
        };
        let displayed = self.selection.confirm(&merged);

        self.commands
            .send(Command::Resubscribe(displayed))
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(outcomes)
    }

    /// Number of reconnect attempts so far.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Tear down the connection: cancels a pending reconnect, abandons in-flight backfills and
    /// detaches the event listener.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            error!(?error, "stream client task failed");
        }
    }
}

struct StreamLoop {
    config: StreamClientConfig,
    http: reqwest::Client,
    history: Arc<dyn HistorySource>,
    consumer: StreamConsumer,
    reconnects: Arc<AtomicU64>,
}

impl StreamLoop {
    fn track(&mut self) {
        let timeframe = self.config.timeframe;
        self.consumer.retain_keys(|key| key.timeframe == timeframe);
        for symbol in &self.config.symbols {
            self.consumer
                .track(StreamKey::new(symbol, self.config.timeframe));
        }
    }

    fn spawn_backfill(&self, backfills: &mut JoinSet<BackfillResult>, request: BackfillRequest) {
        debug!(
            id = request.id,
            symbol = %request.key.symbol,
            timeframe = %request.key.timeframe,
            after_seq = request.after_seq,
            up_to_seq = ?request.up_to_seq,
            "starting backfill"
        );
        let history = self.history.clone();
        backfills.spawn(async move {
            let result = history.fetch(&request).await;
            (request, result)
        });
    }

    fn on_backfill(
        &mut self,
        backfills: &mut JoinSet<BackfillResult>,
        joined: Result<BackfillResult, tokio::task::JoinError>,
    ) {
        match joined {
            Ok((request, Ok(bars))) => {
                if let Some(next) = self.consumer.apply_backfill(&request, bars) {
                    self.spawn_backfill(backfills, next);
                }
            }
            Ok((request, Err(error))) => {
                self.consumer.backfill_failed(&request, &error.to_string())
            }
            Err(error) if error.is_cancelled() => {}
            Err(error) => error!(?error, "backfill task panicked"),
        }
    }

    fn on_frame(&mut self, backfills: &mut JoinSet<BackfillResult>, event: &str, data: &str) {
        match StreamEvent::from_named(event, data) {
            Ok(event) => {
                if let Some(request) = self.consumer.on_event(event) {
                    self.spawn_backfill(backfills, request);
                }
            }
            Err(error) => {
                warn!(%event, ?error, "failed to decode stream event");
                debug!(%data, "raw stream event");
            }
        }
    }
}

async fn connect(
    http: &reqwest::Client,
    config: &StreamClientConfig,
    since_seq: Option<u64>,
) -> Result<reqwest::Response, ClientError> {
    let response = http
        .get(config.stream_url(since_seq)?)
        .header(USER_HEADER, config.user.as_str())
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()?;
    Ok(response)
}

enum Disconnect {
    Shutdown,
    Resubscribe,
    Lost,
}

/// Main stream connection loop with auto-reconnect
async fn run_stream_loop(
    mut state: StreamLoop,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(url = %state.config.base_url, symbols = ?state.config.symbols, "starting stream client");

    let mut backoff = state.config.backoff.clone();
    let mut backfills = JoinSet::new();

    'reconnect: loop {
        state.consumer.on_connecting();
        state.track();

        let since_seq = state.consumer.resume_seq(state.config.timeframe);
        let connected = tokio::select! {
            _ = shutdown.changed() => break 'reconnect,
            connected = connect(&state.http, &state.config, since_seq) => connected,
        };

        let disconnect = match connected {
            Ok(response) => {
                info!(timeframe = %state.config.timeframe, ?since_seq, "connected to stream");
                backoff.reset();
                for request in state.consumer.on_open() {
                    state.spawn_backfill(&mut backfills, request);
                }

                let mut body = response.bytes_stream();
                let mut decoder = SseDecoder::new();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break Disconnect::Shutdown,
                        Some(command) = commands.recv() => match command {
                            Command::FocusRegained => {
                                for request in state.consumer.catch_up_requests() {
                                    state.spawn_backfill(&mut backfills, request);
                                }
                            }
                            Command::Resubscribe(timeframe) => {
                                if timeframe != state.config.timeframe {
                                    state.config.timeframe = timeframe;
                                    break Disconnect::Resubscribe;
                                }
                            }
                        },
                        Some(joined) = backfills.join_next() => state.on_backfill(&mut backfills, joined),
                        chunk = body.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for frame in decoder.push(&bytes) {
                                    state.on_frame(&mut backfills, &frame.event, &frame.data);
                                }
                            }
                            Some(Err(error)) => {
                                warn!(%error, "stream read failed");
                                break Disconnect::Lost;
                            }
                            None => {
                                info!("server closed stream");
                                break Disconnect::Lost;
                            }
                        },
                    }
                }
            }
            Err(error) if error.is_terminal() => {
                error!(%error, "stream connection rejected, stopping client");
                break 'reconnect;
            }
            Err(error) => {
                warn!(%error, "failed to connect to stream");
                Disconnect::Lost
            }
        };

        match disconnect {
            Disconnect::Shutdown => break 'reconnect,
            Disconnect::Resubscribe => {
                info!(timeframe = %state.config.timeframe, "resubscribing stream");
                continue 'reconnect;
            }
            Disconnect::Lost => {}
        }

        state.consumer.on_disconnect();
        state
            .reconnects
            .store(state.consumer.reconnect_count(), Ordering::Relaxed);

        let delay = backoff.next_delay();
        debug!(?delay, attempt = backoff.attempt(), "waiting before reconnecting");
        tokio::select! {
            _ = shutdown.changed() => break 'reconnect,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    backfills.abort_all();
    state.consumer.close();
    info!("stream client stopped");
}
