//! State machine types for the compaction controller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{directory::ContainerId, report::CompactionReport};

/// Top-level state of the controller FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run in progress; `pending` holds the next run's default targets.
    Idling,
    Running,
    /// Workers asked to pause; finished jobs are not redispatched.
    Suspending,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idling => write!(f, "idling"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Suspending => write!(f, "suspending"),
        }
    }
}

/// Identifier of a Job Runner task within the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunnerId(pub(crate) u64);

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner-{}", self.0)
    }
}

/// Point-in-time snapshot of the controller, served by the `State` query.
/// Not a live view.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionStats {
    pub status: RunStatus,
    /// Directory cardinality at controller init; advisory.
    pub total_targets: usize,
    pub reserved_count: usize,
    pub pending_count: usize,
    pub ongoing_count: usize,
    pub reserved: Vec<ContainerId>,
    pub pending: Vec<ContainerId>,
    pub ongoing: Vec<ContainerId>,
    pub locked: Vec<ContainerId>,
    /// Wall-clock seconds when the current (or last) run was admitted;
    /// 0 before the first run.
    pub start_time: u64,
    pub reports: Vec<CompactionReport>,
}
