//! Running usage statistics kept by the watchdog.
//!
//! Plain fields, no atomics: one watchdog, one thread.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningStats {
    maximum: i64,
    average: i64,
    checks: u64,
    /// Exact sum of every sample, so the mean never drifts from truncation.
    total: i128,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one overage-adjusted sample into the statistics.
    ///
    /// The average is the streaming mean `(average * (checks - 1) + current) /
    /// checks` evaluated on the exact running sum, so after the first sample it
    /// equals that sample and after `n` samples it is `sum / n` (integer
    /// division). The maximum starts at zero; negative samples never raise it.
    pub fn observe(&mut self, current: i64) {
        if current > self.maximum {
            self.maximum = current;
        }

        self.checks += 1;
        self.total += i128::from(current);
        self.average = (self.total / i128::from(self.checks)) as i64;

        #[cfg(feature = "tracing")]
        tracing::trace!(
            current,
            maximum = self.maximum,
            average = self.average,
            checks = self.checks,
            "quota sample"
        );
    }

    pub fn maximum(&self) -> i64 {
        self.maximum
    }

    pub fn average(&self) -> i64 {
        self.average
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }
}
