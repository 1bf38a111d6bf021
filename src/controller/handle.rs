//! Operator-facing handle to the controller singleton.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::{
    controller::{
        events::{ControlCommand, RunOptions, RunnerEvent},
        types::{CompactionStats, RunnerId},
    },
    directory::ContainerId,
    error::ControlError,
    report::CompactionReport,
};

/// Reply timeout on every synchronous controller operation. Exceeding it
/// surfaces [`ControlError::Timeout`] to the caller without touching FSM
/// state.
pub const SYNC_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Cloneable handle for talking to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    pub(super) command_tx: mpsc::UnboundedSender<ControlCommand>,
    pub(super) event_tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl ControllerHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| ControlError::Closed)?;
        match tokio::time::timeout(SYNC_REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => Err(ControlError::Timeout),
        }
    }

    /// Compact every container with a single concurrent slot.
    pub async fn run(&self) -> Result<(), ControlError> {
        self.run_with(RunOptions::default()).await
    }

    /// Admit a compaction run.
    pub async fn run_with(&self, options: RunOptions) -> Result<(), ControlError> {
        self.call(|reply| ControlCommand::Run {
            options,
            diagnosing: false,
            reply,
        })
        .await?
    }

    /// Read-only diagnosis pass over every container, single slot.
    pub async fn diagnose(&self) -> Result<(), ControlError> {
        self.call(|reply| ControlCommand::Run {
            options: RunOptions::default(),
            diagnosing: true,
            reply,
        })
        .await?
    }

    pub async fn suspend(&self) -> Result<(), ControlError> {
        self.call(|reply| ControlCommand::Suspend { reply }).await?
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        self.call(|reply| ControlCommand::Resume { reply }).await?
    }

    /// Snapshot of the controller state; not a live view.
    pub async fn state(&self) -> Result<CompactionStats, ControlError> {
        self.call(|reply| ControlCommand::State { reply }).await
    }

    /// Shut down the controller. The `id` argument is accepted for API
    /// compatibility and ignored; the whole controller stops.
    pub async fn stop(&self, _id: Option<&str>) -> Result<(), ControlError> {
        self.call(|reply| ControlCommand::Stop { reply }).await
    }

    /// Mark a container temporarily uncompactable during the current run.
    /// Informational; does not affect dispatch.
    pub fn lock(&self, container_id: ContainerId) {
        let _ = self.event_tx.send(RunnerEvent::Lock { container_id });
    }

    /// Runner completion entry point. Normally driven by the Job Runner
    /// tasks; exposed for embedders that relay finishes out-of-band.
    pub fn finish(&self, runner: RunnerId, container_id: ContainerId, report: CompactionReport) {
        let _ = self.event_tx.send(RunnerEvent::Finish {
            runner,
            container_id,
            report,
        });
    }
}
