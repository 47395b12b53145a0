use crate::{error::ApiError, routes::UserId, state::AppState};
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use itertools::Itertools;
use mtf_data::{StreamEvent, SubscriptionFilter, Timeframe};
use serde::Deserialize;
use smol_str::SmolStr;
use std::convert::Infallible;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    /// Comma separated symbols.
    pub symbols: String,
    #[serde(default)]
    pub since_seq: Option<u64>,
    #[serde(default)]
    pub timeframe: Timeframe,
}

impl StreamQuery {
    pub fn symbols(&self) -> Vec<SmolStr> {
        self.symbols
            .split(',')
            .map(str::trim)
            .filter(|symbol| !symbol.is_empty())
            .map(SmolStr::new)
            .unique()
            .collect()
    }
}

/// `GET /stream/market`: the epoch marker, then every finalized bar after `sinceSeq`, then live
/// events for the requested symbols and timeframe.
pub async fn stream_market(
    State(state): State<AppState>,
    UserId(user): UserId,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let symbols = query.symbols();
    if symbols.is_empty() {
        return Err(ApiError::BadRequest("symbols must not be empty".to_string()));
    }

    // Subscribe before replaying so nothing published in between is lost
    let live = state.hub.distributor().stream(SubscriptionFilter::new(
        user.clone(),
        symbols.iter().cloned(),
        query.timeframe,
    ));

    // The 1m timeframe is served from the shared buffer and needs no session
    let watch = (!query.timeframe.is_base())
        .then(|| state.hub.watch(&user, symbols.iter().cloned()));

    let mut initial = vec![StreamEvent::Epoch(state.hub.epoch().clone())];
    if let Some(since_seq) = query.since_seq {
        for symbol in &symbols {
            initial.extend(state.hub.replay(&user, symbol, query.timeframe, since_seq));
        }
    } else if !query.timeframe.is_base() {
        for symbol in &symbols {
            state.hub.coordinator().ensure_live(&user, symbol, query.timeframe);
        }
    }

    info!(
        %user,
        symbols = %symbols.iter().join(","),
        timeframe = %query.timeframe,
        since_seq = ?query.since_seq,
        replayed = initial.len() - 1,
        "stream opened"
    );

    let events = stream::iter(initial)
        .chain(live.map(|envelope| envelope.event))
        .filter_map(move |event| {
            // Sessions stay attached until the client disconnects and the stream is dropped
            let _watch = &watch;
            std::future::ready(to_sse_event(&event).map(Ok))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keepalive)))
}

/// Encode a [`StreamEvent`] as a named SSE frame. Finalized bars carry their seq as the frame id.
pub fn to_sse_event(event: &StreamEvent) -> Option<Event> {
    let data = match event.payload_json() {
        Ok(data) => data,
        Err(error) => {
            warn!(event = event.name(), ?error, "failed to encode stream event");
            return None;
        }
    };

    let frame = Event::default().event(event.name()).data(data);
    Some(match event.seq() {
        Some(seq) => frame.id(seq.to_string()),
        None => frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_query_symbols() {
        struct TestCase {
            input: &'static str,
            expected: Vec<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0
                input: "SPY,QQQ",
                expected: vec!["SPY", "QQQ"],
            },
            TestCase {
                // TC1: whitespace, duplicates and empties
                input: " SPY , ,QQQ,SPY,",
                expected: vec!["SPY", "QQQ"],
            },
            TestCase {
                // TC2
                input: "",
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let query = StreamQuery {
                symbols: test.input.to_string(),
                since_seq: None,
                timeframe: Timeframe::M1,
            };
            assert_eq!(query.symbols(), test.expected, "TC{} failed", index);
        }
    }
}
