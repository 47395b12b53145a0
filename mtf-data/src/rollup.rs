//! Pure aggregation of 1-minute bars into k-minute [`RolledBar`]s.
//!
//! Bucket boundaries are the UTC minute floored to a multiple of k. Exchange-session alignment is
//! left to the upstream bar builder.

use crate::{
    bar::{BAR_1M_MS, Bar1m, RolledBar},
    timeframe::Timeframe,
};
use itertools::Itertools;

/// Deterministic bucket start for `ts_ms` in a `k`-minute timeframe.
#[inline]
pub fn floor_to_k_minute(ts_ms: i64, k: u32) -> i64 {
    let bucket_ms = i64::from(k.max(1)) * BAR_1M_MS;
    ts_ms.div_euclid(bucket_ms) * bucket_ms
}

/// Exclusive end of the bucket starting at `bucket_start`.
#[inline]
pub fn bucket_end(bucket_start: i64, timeframe: Timeframe) -> i64 {
    bucket_start + timeframe.duration_ms()
}

/// Batch rollup used for history backfill.
///
/// Buckets are emitted in ascending order with `seq` assigned `1..=N`. Identical input always
/// yields identical output, regardless of the order the 1-minute bars are supplied in.
pub fn rollup_from_1m(bars_1m: &[Bar1m], timeframe: Timeframe) -> Vec<RolledBar> {
    let mut rolled: Vec<RolledBar> = Vec::new();

    for bar in bars_1m
        .iter()
        .sorted_by_key(|bar| (bar.bar_start, bar.seq))
    {
        let bucket_start = floor_to_k_minute(bar.bar_start, timeframe.minutes());
        match rolled.last_mut() {
            Some(current) if current.bar_start == bucket_start => merge_1m(current, bar),
            _ => {
                let seq = rolled.len() as u64 + 1;
                rolled.push(seed_bucket(&bar.symbol, timeframe, bar, seq));
            }
        }
    }

    rolled
}

/// Incremental rollup used for live bucket accumulation.
///
/// - `current == None`: start a bucket seeded from `closed` (with `seq` 0, the caller sequences).
/// - `closed` inside `current`'s bucket: return the merged bucket.
/// - otherwise: `None`, meaning `current` is complete and should be emitted by the caller before
///   a fresh bucket is started.
pub fn apply_1m_close_to_rollup(
    symbol: &str,
    timeframe: Timeframe,
    closed: &Bar1m,
    current: Option<&RolledBar>,
) -> Option<RolledBar> {
    match current {
        None => Some(seed_bucket(symbol, timeframe, closed, 0)),
        Some(current) if current.contains(closed.bar_start) => {
            let mut merged = current.clone();
            merge_1m(&mut merged, closed);
            Some(merged)
        }
        Some(_) => None,
    }
}

/// Whether `latest` has covered the final minute of `rolled`'s bucket.
pub fn is_bucket_complete(rolled: &RolledBar, latest: &Bar1m) -> bool {
    latest.bar_end >= rolled.bar_end
}

pub(crate) fn seed_bucket(
    symbol: &str,
    timeframe: Timeframe,
    bar: &Bar1m,
    seq: u64,
) -> RolledBar {
    let bar_start = floor_to_k_minute(bar.bar_start, timeframe.minutes());
    RolledBar {
        symbol: symbol.into(),
        timeframe,
        seq,
        bar_start,
        bar_end: bucket_end(bar_start, timeframe),
        ohlcv: bar.ohlcv,
    }
}

fn merge_1m(rolled: &mut RolledBar, bar: &Bar1m) {
    let ohlcv = &mut rolled.ohlcv;
    ohlcv.high = ohlcv.high.max(bar.ohlcv.high);
    ohlcv.low = ohlcv.low.min(bar.ohlcv.low);
    ohlcv.close = bar.ohlcv.close;
    ohlcv.volume += bar.ohlcv.volume;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Ohlcv;

    // 2023-11-14T22:15:00Z, aligned to 15 minutes
    const T0: i64 = 1_700_000_100_000;

    fn minute(index: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar1m {
        Bar1m::new(
            "SPY",
            index as u64 + 1,
            T0 + index * BAR_1M_MS,
            Ohlcv::new(open, high, low, close, volume),
        )
    }

    fn ten_minutes() -> Vec<Bar1m> {
        (0..10)
            .map(|i| {
                let base = 100.0 + i as f64;
                minute(i, base, base + 2.0, base - 1.5, base + 0.5, 10.0 + i as f64)
            })
            .collect()
    }

    fn tf(input: &str) -> Timeframe {
        input.parse().unwrap()
    }

    #[test]
    fn test_floor_to_k_minute() {
        struct TestCase {
            ts_ms: i64,
            k: u32,
            expected: i64,
        }

        let tests = vec![
            TestCase {
                // TC0: already aligned
                ts_ms: T0,
                k: 5,
                expected: T0,
            },
            TestCase {
                // TC1: mid-bucket floors back
                ts_ms: T0 + 4 * BAR_1M_MS + 59_999,
                k: 5,
                expected: T0,
            },
            TestCase {
                // TC2: next bucket boundary
                ts_ms: T0 + 5 * BAR_1M_MS,
                k: 5,
                expected: T0 + 5 * BAR_1M_MS,
            },
            TestCase {
                // TC3: sub-minute precision is floored to the minute
                ts_ms: T0 + 30_500,
                k: 1,
                expected: T0,
            },
            TestCase {
                // TC4: hourly buckets align to the top of the UTC hour
                ts_ms: T0,
                k: 60,
                expected: 1_699_999_200_000,
            },
            TestCase {
                // TC5: negative timestamps floor towards -inf
                ts_ms: -1,
                k: 1,
                expected: -BAR_1M_MS,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = floor_to_k_minute(test.ts_ms, test.k);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_rollup_two_five_minute_buckets_match_manual_aggregation() {
        let bars = ten_minutes();

        let rolled = rollup_from_1m(&bars, tf("5m"));

        assert_eq!(rolled.len(), 2);
        for (bucket, group) in rolled.iter().zip(bars.chunks(5)) {
            assert_eq!(bucket.ohlcv.open, group[0].ohlcv.open);
            assert_eq!(bucket.ohlcv.close, group[4].ohlcv.close);
            assert_eq!(
                bucket.ohlcv.high,
                group.iter().map(|b| b.ohlcv.high).fold(f64::MIN, f64::max)
            );
            assert_eq!(
                bucket.ohlcv.low,
                group.iter().map(|b| b.ohlcv.low).fold(f64::MAX, f64::min)
            );
            assert_eq!(
                bucket.ohlcv.volume,
                group.iter().map(|b| b.ohlcv.volume).sum::<f64>()
            );
            assert_eq!(bucket.bar_end - bucket.bar_start, 5 * BAR_1M_MS);
        }
        assert_eq!(rolled[0].bar_start, T0);
        assert_eq!(rolled[1].bar_start, T0 + 5 * BAR_1M_MS);
    }

    #[test]
    fn test_rollup_is_deterministic_with_sequential_seq() {
        // T0 sits mid-way through a 2m bucket, so ten minutes touch six buckets
        let bars = ten_minutes();
        let mut shuffled = bars.clone();
        shuffled.reverse();
        shuffled.swap(2, 7);

        let first = rollup_from_1m(&bars, tf("2m"));
        let second = rollup_from_1m(&bars, tf("2m"));
        let from_shuffled = rollup_from_1m(&shuffled, tf("2m"));

        assert_eq!(first, second);
        assert_eq!(first, from_shuffled);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(
            first.iter().map(|bar| bar.seq).collect::<Vec<_>>(),
            (1..=6).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn test_rollup_with_missing_minutes_keeps_partial_buckets() {
        let bars = ten_minutes()
            .into_iter()
            .filter(|bar| ![1, 2, 6].contains(&(bar.seq - 1)))
            .collect::<Vec<_>>();

        let rolled = rollup_from_1m(&bars, tf("5m"));

        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0].ohlcv.volume, 10.0 + 13.0 + 14.0);
        assert_eq!(rolled[1].ohlcv.open, 105.0);
    }

    #[test]
    fn test_rollup_empty_input() {
        assert!(rollup_from_1m(&[], tf("5m")).is_empty());
    }

    #[test]
    fn test_apply_close_with_no_current_seeds_bucket() {
        let seed = minute(2, 101.0, 103.0, 99.0, 102.0, 42.0);

        let rolled = apply_1m_close_to_rollup("SPY", tf("5m"), &seed, None).unwrap();

        assert_eq!(rolled.ohlcv.open, seed.ohlcv.open);
        assert_eq!(rolled.ohlcv.high, seed.ohlcv.high);
        assert_eq!(rolled.ohlcv.low, seed.ohlcv.low);
        assert_eq!(rolled.ohlcv.close, seed.ohlcv.close);
        assert_eq!(rolled.ohlcv.volume, seed.ohlcv.volume);
        assert_eq!(rolled.bar_start, T0);
        assert_eq!(rolled.bar_end, T0 + 5 * BAR_1M_MS);
        assert_eq!(rolled.seq, 0);
    }

    #[test]
    fn test_apply_close_within_bucket_merges() {
        let current =
            apply_1m_close_to_rollup("SPY", tf("5m"), &minute(0, 100.0, 101.0, 99.0, 100.5, 5.0), None)
                .unwrap();
        let next = minute(1, 100.5, 104.0, 98.0, 103.0, 7.0);

        let merged = apply_1m_close_to_rollup("SPY", tf("5m"), &next, Some(&current)).unwrap();

        assert_eq!(merged.ohlcv.open, current.ohlcv.open);
        assert_eq!(merged.ohlcv.high, current.ohlcv.high.max(next.ohlcv.high));
        assert_eq!(merged.ohlcv.low, current.ohlcv.low.min(next.ohlcv.low));
        assert_eq!(merged.ohlcv.close, next.ohlcv.close);
        assert_eq!(merged.ohlcv.volume, current.ohlcv.volume + next.ohlcv.volume);
        assert_eq!(merged.bar_start, current.bar_start);
    }

    #[test]
    fn test_apply_close_outside_bucket_signals_completion() {
        let current =
            apply_1m_close_to_rollup("SPY", tf("5m"), &minute(4, 1.0, 1.0, 1.0, 1.0, 1.0), None)
                .unwrap();

        let next_bucket = minute(5, 2.0, 2.0, 2.0, 2.0, 1.0);

        assert!(apply_1m_close_to_rollup("SPY", tf("5m"), &next_bucket, Some(&current)).is_none());
        assert!(is_bucket_complete(&current, &minute(4, 1.0, 1.0, 1.0, 1.0, 1.0)));
        assert!(!is_bucket_complete(&current, &minute(3, 1.0, 1.0, 1.0, 1.0, 1.0)));
    }
}
