/// Classification of an incoming finalized bar against the last applied `seq`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SeqCheck {
    /// `seq <= last_seq`: already applied.
    Duplicate,
    /// `seq == last_seq + 1`, or the very first bar.
    Accept,
    /// `seq > last_seq + 1`: bars `expected..received` are missing.
    Gap { expected: u64, received: u64 },
}

/// Tracks the last applied `seq` of one `(symbol, timeframe)` stream.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SequenceTracker {
    last_seq: u64,
}

impl SequenceTracker {
    pub fn new(last_seq: u64) -> Self {
        Self { last_seq }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn check(&self, seq: u64) -> SeqCheck {
        if self.last_seq == 0 {
            return SeqCheck::Accept;
        }
        if seq <= self.last_seq {
            SeqCheck::Duplicate
        } else if seq == self.last_seq + 1 {
            SeqCheck::Accept
        } else {
            SeqCheck::Gap {
                expected: self.last_seq + 1,
                received: seq,
            }
        }
    }

    pub fn advance(&mut self, seq: u64) {
        self.last_seq = seq;
    }

    pub fn reset(&mut self) {
        self.last_seq = 0;
    }
}
