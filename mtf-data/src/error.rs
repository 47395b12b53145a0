use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated in `mtf-data`.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    #[error("no 1-minute bars available yet for {0}")]
    DataUnavailable(SmolStr),

    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error(
        "\
        OutOfOrder: 1-minute bar for {symbol} with seq {seq} does not follow on from \
        the last appended seq {last_seq} \
    "
    )]
    OutOfOrder {
        symbol: SmolStr,
        last_seq: u64,
        seq: u64,
    },

    #[error(
        "StaleBucket: 1-minute bar for {symbol} starting at {bar_start} does not advance \
        past the last bucket starting at {last_bar_start}"
    )]
    StaleBucket {
        symbol: SmolStr,
        last_bar_start: i64,
        bar_start: i64,
    },

    #[error("timeframe switch failed for {symbol}: {reason}")]
    Switch { symbol: SmolStr, reason: String },

    #[error("failed to decode stream event '{event}': {reason}")]
    Decode { event: String, reason: String },
}

impl DataError {
    /// Determine if an error can be ignored by the pipeline, with results populating once live
    /// 1-minute data arrives.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_recoverable(&self) -> bool {
        match self {
            DataError::DataUnavailable(_) => true,
            DataError::OutOfOrder { .. } | DataError::StaleBucket { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_is_recoverable() {
        struct TestCase {
            input: DataError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: no bars yet is recoverable
                input: DataError::DataUnavailable(SmolStr::new("SPY")),
                expected: true,
            },
            TestCase {
                // TC1: a duplicate close from the bar builder is dropped, not fatal
                input: DataError::OutOfOrder {
                    symbol: SmolStr::new("SPY"),
                    last_seq: 10,
                    seq: 10,
                },
                expected: true,
            },
            TestCase {
                // TC2: failed switch is surfaced to the caller
                input: DataError::Switch {
                    symbol: SmolStr::new("SPY"),
                    reason: "storage offline".to_string(),
                },
                expected: false,
            },
            TestCase {
                // TC3: undecodable payloads are not recoverable by the pipeline
                input: DataError::Decode {
                    event: "bar".to_string(),
                    reason: "eof".to_string(),
                },
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_recoverable();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
