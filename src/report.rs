//! Per-container compaction outcome.

use serde::{Deserialize, Serialize};

use crate::directory::ContainerId;

/// Outcome of one compaction or diagnosis pass over a single container.
///
/// Produced by the worker and forwarded unchanged through the Job Runner to
/// the controller, which accumulates reports for the duration of a run and
/// sorts them once at the run-completion boundary. The derived `Ord` sorts
/// by container id first, so a completed run's report list reads in
/// directory order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompactionReport {
    pub container_id: ContainerId,
    /// True when the pass was read-only diagnosis.
    pub diagnosed: bool,
    /// Entries scanned, tombstones included.
    pub total_entries: u64,
    /// Entries still live after the pass.
    pub active_entries: u64,
    /// Bytes reclaimed (always 0 for a diagnosis pass).
    pub reclaimed_bytes: u64,
    pub duration_ms: u64,
    /// Worker-side failure, if any. The controller treats the report as a
    /// completed job either way.
    pub error: Option<String>,
}

impl CompactionReport {
    /// An empty report for a pass that never touched the container.
    pub fn empty(container_id: ContainerId, diagnosed: bool) -> Self {
        Self {
            container_id,
            diagnosed,
            total_entries: 0,
            active_entries: 0,
            reclaimed_bytes: 0,
            duration_ms: 0,
            error: None,
        }
    }

    /// Same report with an error attached.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
