use crate::{bar::BAR_1M_MS, error::DataError};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Bar timeframe expressed as a whole number of minutes.
///
/// Parsed from `"<n>m"` or `"<n>h"` and rendered canonically, so `"60m"` and `"1h"` are the same
/// [`Timeframe`] and both render as `"1h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe(u32);

impl Timeframe {
    /// The base 1-minute timeframe every other timeframe is derived from.
    pub const M1: Self = Self(1);

    /// Largest supported timeframe (one UTC day).
    pub const MAX_MINUTES: u32 = 1440;

    pub fn from_minutes(minutes: u32) -> Result<Self, DataError> {
        if (1..=Self::MAX_MINUTES).contains(&minutes) {
            Ok(Self(minutes))
        } else {
            Err(DataError::InvalidTimeframe(format!(
                "{minutes} minutes is outside 1..={}",
                Self::MAX_MINUTES
            )))
        }
    }

    pub const fn minutes(self) -> u32 {
        self.0
    }

    /// Bucket width in milliseconds.
    pub const fn duration_ms(self) -> i64 {
        self.0 as i64 * BAR_1M_MS
    }

    /// True for the 1-minute timeframe.
    pub const fn is_base(self) -> bool {
        self.0 == 1
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M1
    }
}

impl FromStr for Timeframe {
    type Err = DataError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_ascii_lowercase();
        let invalid = || DataError::InvalidTimeframe(input.to_string());

        let (digits, multiplier) = if let Some(digits) = normalised.strip_suffix('h') {
            (digits, 60)
        } else if let Some(digits) = normalised.strip_suffix('m') {
            (digits, 1)
        } else {
            return Err(invalid());
        };

        let count = digits.parse::<u32>().map_err(|_| invalid())?;
        let minutes = count.checked_mul(multiplier).ok_or_else(invalid)?;
        Self::from_minutes(minutes)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 60 == 0 {
            write!(f, "{}h", self.0 / 60)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_from_str() {
        struct TestCase {
            input: &'static str,
            expected: Option<u32>,
        }

        let tests = vec![
            TestCase {
                // TC0: base timeframe
                input: "1m",
                expected: Some(1),
            },
            TestCase {
                // TC1: minutes
                input: "5m",
                expected: Some(5),
            },
            TestCase {
                // TC2: hours
                input: "1h",
                expected: Some(60),
            },
            TestCase {
                // TC3: whitespace and case are tolerated
                input: " 15M ",
                expected: Some(15),
            },
            TestCase {
                // TC4: zero is rejected
                input: "0m",
                expected: None,
            },
            TestCase {
                // TC5: beyond one day is rejected
                input: "25h",
                expected: None,
            },
            TestCase {
                // TC6: missing unit
                input: "5",
                expected: None,
            },
            TestCase {
                // TC7: garbage
                input: "fivem",
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.parse::<Timeframe>().ok().map(Timeframe::minutes);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_timeframe_display_is_canonical() {
        assert_eq!("60m".parse::<Timeframe>().unwrap().to_string(), "1h");
        assert_eq!("90m".parse::<Timeframe>().unwrap().to_string(), "90m");
        assert_eq!(Timeframe::M1.to_string(), "1m");
    }

    #[test]
    fn test_timeframe_serde_as_string() {
        let timeframe: Timeframe = serde_json::from_str("\"30m\"").unwrap();
        assert_eq!(timeframe.minutes(), 30);
        assert_eq!(serde_json::to_string(&timeframe).unwrap(), "\"30m\"");
        assert!(serde_json::from_str::<Timeframe>("\"2d\"").is_err());
    }
}
