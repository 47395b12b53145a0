use crate::{config::StreamClientConfig, consumer::BackfillRequest, error::ClientError};
use async_trait::async_trait;
use mtf_data::{RolledBar, SwitchOutcome, Timeframe};
use serde::Serialize;
use tracing::{debug, warn};

pub const USER_HEADER: &str = "x-user-id";

/// Source of finalized bars for gap backfill.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch every bar of `request.key` in `(after_seq, up_to_seq]`, ascending by `seq`.
    async fn fetch(&self, request: &BackfillRequest) -> Result<Vec<RolledBar>, ClientError>;
}

/// REST client for the history and timeframe switch endpoints.
#[derive(Debug, Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    config: StreamClientConfig,
}

#[derive(Serialize)]
struct SwitchRequest<'a> {
    symbol: &'a str,
    timeframe: String,
}

impl HttpApi {
    pub fn new(config: StreamClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: StreamClientConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &StreamClientConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Fetch one page of history after `since_seq`, retrying transient failures.
    pub async fn history_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_seq: u64,
    ) -> Result<Vec<RolledBar>, ClientError> {
        let url = self.config.history_url(symbol, timeframe, since_seq)?;

        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(self.config.backfill_timeout, async {
                let response = self
                    .http
                    .get(url.clone())
                    .header(USER_HEADER, self.config.user.as_str())
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, ClientError>(response.json::<Vec<RolledBar>>().await?)
            })
            .await
            .unwrap_or(Err(ClientError::Timeout(self.config.backfill_timeout)));

            match result {
                Ok(bars) => return Ok(bars),
                Err(error) if error.is_terminal() || attempt >= self.config.backfill_retries => {
                    return Err(error);
                }
                Err(error) => {
                    attempt += 1;
                    warn!(%symbol, %timeframe, since_seq, attempt, %error, "history fetch failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Ask the server to switch `symbol` to `timeframe` for this user.
    ///
    /// A rejected switch is reported through [`SwitchOutcome::error`] rather than `Err`.
    pub async fn switch_timeframe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<SwitchOutcome, ClientError> {
        let response = self
            .http
            .post(self.config.switch_url()?)
            .header(USER_HEADER, self.config.user.as_str())
            .json(&SwitchRequest {
                symbol,
                timeframe: timeframe.to_string(),
            })
            .send()
            .await?;

        let outcome = response.json::<SwitchOutcome>().await?;
        debug!(%symbol, %timeframe, ok = outcome.ok, bars = outcome.bars_count, "timeframe switch answered");
        Ok(outcome)
    }
}

#[async_trait]
impl HistorySource for HttpApi {
    async fn fetch(&self, request: &BackfillRequest) -> Result<Vec<RolledBar>, ClientError> {
        let mut bars = Vec::new();
        let mut since_seq = request.after_seq;

        loop {
            let page = self
                .history_page(&request.key.symbol, request.key.timeframe, since_seq)
                .await?;
            let full = page.len() >= self.config.backfill_limit;
            let previous = since_seq;

            let mut reached_end = !full;
            for bar in page {
                if bar.seq <= since_seq {
                    continue;
                }
                if request.up_to_seq.is_some_and(|up_to| bar.seq > up_to) {
                    reached_end = true;
                    break;
                }
                since_seq = bar.seq;
                bars.push(bar);
            }

            if reached_end
                || since_seq == previous
                || request.up_to_seq.is_some_and(|up_to| since_seq >= up_to)
            {
                break;
            }
        }

        debug!(
            symbol = %request.key.symbol,
            timeframe = %request.key.timeframe,
            after_seq = request.after_seq,
            fetched = bars.len(),
            "history fetched"
        );
        Ok(bars)
    }
}
