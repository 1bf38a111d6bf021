//! Commands and events for the compaction controller.
//!
//! Synchronous operator commands carry a oneshot reply channel; asynchronous
//! runner events do not. The controller consumes both from separate mpsc
//! channels in a single `select!` loop.

use tokio::sync::oneshot;

use crate::{
    controller::types::{CompactionStats, RunnerId},
    directory::ContainerId,
    error::ControlError,
    report::CompactionReport,
    worker::CompactionCallback,
};

/// Parameters of a `run` admission.
#[derive(Clone)]
pub struct RunOptions {
    /// Containers to compact this run; `None` means every container in the
    /// directory.
    pub targets: Option<Vec<ContainerId>>,
    /// Upper bound on simultaneously-dispatched containers.
    pub max_concurrent: usize,
    /// Per-job completion hook, handed through to the workers.
    pub callback: Option<CompactionCallback>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            targets: None,
            max_concurrent: 1,
            callback: None,
        }
    }
}

/// Synchronous commands sent TO the controller (from the operator handle).
pub(super) enum ControlCommand {
    Run {
        options: RunOptions,
        diagnosing: bool,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Suspend {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    State {
        reply: oneshot::Sender<CompactionStats>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Asynchronous events sent TO the controller (from Job Runner tasks).
pub(super) enum RunnerEvent {
    /// A container was marked temporarily uncompactable mid-run.
    Lock { container_id: ContainerId },
    /// A runner's worker completed its pass.
    Finish {
        runner: RunnerId,
        container_id: ContainerId,
        report: CompactionReport,
    },
}
