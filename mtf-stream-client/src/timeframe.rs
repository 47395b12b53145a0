use mtf_data::{SwitchOutcome, Timeframe};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What to display when the server rejects a requested timeframe.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Keep showing the requested timeframe.
    #[default]
    KeepOptimistic,
    /// Fall back to the last timeframe the server confirmed.
    Revert,
}

/// Chart timeframe as a two phase value: a requested `pending` timeframe is shown optimistically
/// until the server answers, then becomes `applied` or is rolled back per [`RollbackPolicy`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct TimeframeSelection {
    applied: Timeframe,
    pending: Option<Timeframe>,
    policy: RollbackPolicy,
}

impl TimeframeSelection {
    pub fn new(applied: Timeframe, policy: RollbackPolicy) -> Self {
        Self {
            applied,
            pending: None,
            policy,
        }
    }

    pub fn applied(&self) -> Timeframe {
        self.applied
    }

    pub fn pending(&self) -> Option<Timeframe> {
        self.pending
    }

    /// Timeframe to render right now.
    pub fn displayed(&self) -> Timeframe {
        self.pending.unwrap_or(self.applied)
    }

    /// Record a user request, returning `false` if it is already displayed.
    pub fn request(&mut self, timeframe: Timeframe) -> bool {
        if timeframe == self.displayed() {
            return false;
        }
        self.pending = (timeframe != self.applied).then_some(timeframe);
        true
    }

    /// Settle the pending request with the server's answer, returning the timeframe now displayed.
    pub fn confirm(&mut self, outcome: &SwitchOutcome) -> Timeframe {
        let Some(pending) = self.pending.take() else {
            return self.applied;
        };

        if outcome.ok {
            info!(timeframe = %pending, bars = outcome.bars_count, "timeframe applied");
            self.applied = pending;
            return self.applied;
        }

        match self.policy {
            RollbackPolicy::KeepOptimistic => {
                warn!(timeframe = %pending, error = ?outcome.error, "timeframe switch rejected, keeping selection");
                self.applied = pending;
            }
            RollbackPolicy::Revert => {
                warn!(timeframe = %pending, reverted_to = %self.applied, error = ?outcome.error, "timeframe switch rejected, reverting");
            }
        }
        self.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtf_data::DataError;

    fn tf(minutes: u32) -> Timeframe {
        Timeframe::from_minutes(minutes).unwrap()
    }

    #[test]
    fn test_timeframe_selection_confirm() {
        struct TestCase {
            policy: RollbackPolicy,
            outcome: SwitchOutcome,
            expected: Timeframe,
        }

        let rejected = SwitchOutcome::failure(&DataError::InvalidTimeframe("7x".to_string()));

        let tests = vec![
            TestCase {
                // TC0
                policy: RollbackPolicy::KeepOptimistic,
                outcome: SwitchOutcome::success(12),
                expected: tf(5),
            },
            TestCase {
                // TC1
                policy: RollbackPolicy::Revert,
                outcome: SwitchOutcome::success(12),
                expected: tf(5),
            },
            TestCase {
                // TC2
                policy: RollbackPolicy::KeepOptimistic,
                outcome: rejected.clone(),
                expected: tf(5),
            },
            TestCase {
                // TC3
                policy: RollbackPolicy::Revert,
                outcome: rejected,
                expected: Timeframe::M1,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut selection = TimeframeSelection::new(Timeframe::M1, test.policy);
            assert!(selection.request(tf(5)), "TC{} failed", index);
            assert_eq!(selection.displayed(), tf(5), "TC{} failed", index);

            let actual = selection.confirm(&test.outcome);

            assert_eq!(actual, test.expected, "TC{} failed", index);
            assert_eq!(selection.displayed(), test.expected, "TC{} failed", index);
            assert_eq!(selection.pending(), None, "TC{} failed", index);
        }
    }

    #[test]
    fn test_request_same_timeframe_is_noop() {
        let mut selection = TimeframeSelection::new(tf(5), RollbackPolicy::Revert);

        assert!(!selection.request(tf(5)));
        assert!(selection.request(tf(15)));
        assert!(!selection.request(tf(15)));

        // Going back to the applied timeframe cancels the pending request
        assert!(selection.request(tf(5)));
        assert_eq!(selection.pending(), None);
        assert_eq!(selection.confirm(&SwitchOutcome::success(0)), tf(5));
    }
}
