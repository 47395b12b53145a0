use crate::{error::ApiError, state::AppState, stream::stream_market};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Query, State},
    http::{StatusCode, request::Parts},
    routing::{get, post},
};
use mtf_data::{
    Bar1m, HistoryQuery, RolledBar, SwitchOutcome, Timeframe, bar::BAR_1M_MS,
    bus::BusEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use smol_str::SmolStr;
use std::convert::Infallible;
use tracing::{debug, warn};

/// Header carrying the caller identity.
pub const USER_HEADER: &str = "x-user-id";
pub const ANONYMOUS: &str = "anonymous";

/// Caller identity taken from the [`USER_HEADER`], `anonymous` when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct UserId(pub SmolStr);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS);
        Ok(UserId(SmolStr::new(user)))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwitchRequest {
    pub symbol: SmolStr,
    pub timeframe: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub delivered: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stream/market", get(stream_market))
        .route("/api/history", get(history))
        .route("/api/chart/timeframe", post(switch_timeframe))
        .route("/api/bars/1m", post(ingest_bar))
        .route("/api/bars/1m/reconcile", post(ingest_correction))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "epoch": state.hub.epoch(),
        "symbols": state.hub.buffer().symbols(),
        "sessions": state.hub.coordinator().session_count(),
        "subscribers": state.hub.distributor().receiver_count(),
    }))
}

/// `GET /api/history`: finalized bars, ascending by `seq`.
async fn history(
    State(state): State<AppState>,
    UserId(user): UserId,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<RolledBar>> {
    let bars = state.hub.history(&user, &query);
    debug!(
        %user,
        symbol = %query.symbol,
        timeframe = %query.timeframe,
        since_seq = ?query.since_seq,
        bars = bars.len(),
        "history served"
    );
    Json(bars)
}

/// `POST /api/chart/timeframe`: an unparseable timeframe is reported in the outcome body like any
/// other switch failure.
async fn switch_timeframe(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(request): Json<SwitchRequest>,
) -> Json<SwitchOutcome> {
    let outcome = match request.timeframe.parse::<Timeframe>() {
        Ok(timeframe) => state
            .hub
            .switch_timeframe(&user, &request.symbol, timeframe),
        Err(error) => {
            warn!(%user, symbol = %request.symbol, ?error, "rejected timeframe switch");
            SwitchOutcome::failure(&error)
        }
    };
    Json(outcome)
}

async fn ingest_bar(
    State(state): State<AppState>,
    Json(bar): Json<Bar1m>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    validate(&bar)?;
    let delivered = state.bus.publish(BusEvent::BarClosed(bar)).await;
    Ok((StatusCode::ACCEPTED, Json(Accepted { delivered })))
}

async fn ingest_correction(
    State(state): State<AppState>,
    Json(bar): Json<Bar1m>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    validate(&bar)?;
    let delivered = state.bus.publish(BusEvent::BarCorrected(bar)).await;
    Ok((StatusCode::ACCEPTED, Json(Accepted { delivered })))
}

fn validate(bar: &Bar1m) -> Result<(), ApiError> {
    if bar.symbol.is_empty() {
        return Err(ApiError::BadRequest("symbol must not be empty".to_string()));
    }
    if bar.seq == 0 {
        return Err(ApiError::BadRequest("seq starts at 1".to_string()));
    }
    if bar.bar_end.checked_sub(bar.bar_start) != Some(BAR_1M_MS)
        || bar.bar_start.rem_euclid(BAR_1M_MS) != 0
    {
        return Err(ApiError::BadRequest(format!(
            "bar [{}, {}) is not an aligned 1-minute bucket",
            bar.bar_start, bar.bar_end
        )));
    }
    Ok(())
}
