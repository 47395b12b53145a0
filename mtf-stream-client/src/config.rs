use crate::{backoff::Backoff, error::ClientError};
use mtf_data::Timeframe;
use smol_str::SmolStr;
use std::time::Duration;
use url::Url;

/// Local server on [`DEFAULT_PORT`](mtf_data::protocol::DEFAULT_PORT).
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9001";
pub const DEFAULT_BACKFILL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKFILL_RETRIES: u32 = 2;
pub const DEFAULT_BACKFILL_LIMIT: usize = 500;

/// Stream client configuration
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Server root, stream and history paths are resolved against it
    pub base_url: Url,
    /// Sent as the `x-user-id` header
    pub user: SmolStr,
    pub symbols: Vec<SmolStr>,
    pub timeframe: Timeframe,
    /// Reconnect backoff
    pub backoff: Backoff,
    /// Per attempt history fetch timeout
    pub backfill_timeout: Duration,
    /// Extra attempts after the first failed history fetch
    pub backfill_retries: u32,
    /// Delay between history fetch attempts
    pub retry_delay: Duration,
    /// Maximum bars requested per history fetch
    pub backfill_limit: usize,
    /// Maximum channel buffer size for events
    pub channel_buffer_size: usize,
}

impl StreamClientConfig {
    /// Create a new configuration for the server at `base_url`
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            user: SmolStr::new_static("anonymous"),
            symbols: Vec::new(),
            timeframe: Timeframe::M1,
            backoff: Backoff::default(),
            backfill_timeout: DEFAULT_BACKFILL_TIMEOUT,
            backfill_retries: DEFAULT_BACKFILL_RETRIES,
            retry_delay: Duration::from_millis(250),
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            channel_buffer_size: 1000,
        }
    }

    /// Parse `base_url` and create a configuration for it
    pub fn parse(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self::new(Url::parse(base_url)?))
    }

    pub fn with_user(mut self, user: impl Into<SmolStr>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_symbols<Iter, S>(mut self, symbols: Iter) -> Self
    where
        Iter: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_backfill_timeout(mut self, timeout: Duration) -> Self {
        self.backfill_timeout = timeout;
        self
    }

    pub fn with_backfill_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.backfill_retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_backfill_limit(mut self, limit: usize) -> Self {
        self.backfill_limit = limit;
        self
    }

    /// Set channel buffer size
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    /// `GET /stream/market` url, resuming after `since_seq` when given.
    pub fn stream_url(&self, since_seq: Option<u64>) -> Result<Url, ClientError> {
        let mut url = self.base_url.join("stream/market")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("symbols", &self.symbols.join(","));
            query.append_pair("timeframe", &self.timeframe.to_string());
            if let Some(since_seq) = since_seq {
                query.append_pair("sinceSeq", &since_seq.to_string());
            }
        }
        Ok(url)
    }

    /// `GET /api/history` url for bars after `since_seq`.
    pub fn history_url(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_seq: u64,
    ) -> Result<Url, ClientError> {
        let mut url = self.base_url.join("api/history")?;
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("timeframe", &timeframe.to_string())
            .append_pair("sinceSeq", &since_seq.to_string())
            .append_pair("limit", &self.backfill_limit.to_string());
        Ok(url)
    }

    /// `POST /api/chart/timeframe` url.
    pub fn switch_url(&self) -> Result<Url, ClientError> {
        Ok(self.base_url.join("api/chart/timeframe")?)
    }
}
