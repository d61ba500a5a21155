//! Run report emitted by the engine after each execution.
//!
//! The report is written whether the script finished or was stopped, so a
//! caller can see the watchdog's statistics at the moment execution ended.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Hash256;
use crate::id::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub Uuid);

/// Point-in-time copy of a watchdog's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub thread_id: ThreadId,
    pub base_usage: i64,
    pub limit: i64,
    pub maximum: i64,
    pub average: i64,
    pub checks: u64,
    pub last_sample: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// The infringement handler stopped the run.
    Stopped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: ReportId,

    /// Stable hash of the instrumented program that ran.
    pub program_hash: Hash256,

    /// Engine version string for provenance.
    pub engine_version: String,

    /// Number of injection points the planner inserted.
    pub injection_points: usize,

    pub outcome: RunOutcome,

    /// Watchdog statistics, absent if execution ended before the init sequence.
    pub quota: Option<QuotaSnapshot>,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunReport {
    pub fn new(program_hash: Hash256, injection_points: usize, started_ms: u64) -> Self {
        Self {
            id: ReportId(Uuid::new_v4()),
            program_hash,
            engine_version: crate::VERSION.to_string(),
            injection_points,
            outcome: RunOutcome::Completed,
            quota: None,
            started_ms,
            finished_ms: started_ms,
        }
    }

    pub fn finish(
        mut self,
        finished_ms: u64,
        outcome: RunOutcome,
        quota: Option<QuotaSnapshot>,
    ) -> Self {
        self.finished_ms = finished_ms;
        self.outcome = outcome;
        self.quota = quota;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_ms.saturating_sub(self.started_ms)
    }
}
