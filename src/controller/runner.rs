//! Job Runner: a long-lived task owning one in-flight compaction job.
//!
//! The controller creates runners at run admission and addresses them
//! through their mailbox. A runner relays control signals to its assigned
//! compaction worker, forwards the worker's finish to the controller, and
//! then waits for a new assignment or a stop. It never decides to exit on
//! its own.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    controller::{
        events::RunnerEvent,
        types::RunnerId,
    },
    directory::{ContainerDirectory, ContainerId},
    report::CompactionReport,
    worker::{CompactionCallback, CompactionWorker},
};

/// Messages accepted by a runner's mailbox.
#[derive(Debug)]
pub(crate) enum RunnerMessage {
    Run {
        container_id: ContainerId,
        diagnosing: bool,
    },
    Suspend,
    Resume,
    /// Sent by the worker when its pass completes.
    Finish { report: CompactionReport },
    /// Sent by the worker when its container became temporarily
    /// uncompactable; forwarded to the controller.
    Lock { container_id: ContainerId },
    Stop,
}

/// Worker-facing reference to a runner's mailbox.
///
/// Handed to the compaction worker at job start; the worker uses it to
/// report completion and lock events back through the runner.
#[derive(Clone)]
pub struct RunnerRef {
    tx: mpsc::UnboundedSender<RunnerMessage>,
}

impl RunnerRef {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RunnerMessage>) -> Self {
        Self { tx }
    }

    /// Report the finished pass. The runner forwards it to the controller.
    pub fn finish(&self, report: CompactionReport) {
        let _ = self.tx.send(RunnerMessage::Finish { report });
    }

    /// Mark the container temporarily uncompactable.
    pub fn lock(&self, container_id: ContainerId) {
        let _ = self.tx.send(RunnerMessage::Lock { container_id });
    }
}

struct Assignment {
    container_id: ContainerId,
    worker: Arc<dyn CompactionWorker>,
}

struct JobRunner {
    id: RunnerId,
    /// Clone of the mailbox sender, wrapped into the [`RunnerRef`] handed to
    /// workers.
    mailbox_tx: mpsc::UnboundedSender<RunnerMessage>,
    events: mpsc::UnboundedSender<RunnerEvent>,
    directory: Arc<ContainerDirectory>,
    callback: Option<CompactionCallback>,
    assignment: Option<Assignment>,
}

/// Spawn a runner task; returns its mailbox sender.
pub(super) fn spawn(
    id: RunnerId,
    events: mpsc::UnboundedSender<RunnerEvent>,
    directory: Arc<ContainerDirectory>,
    callback: Option<CompactionCallback>,
) -> mpsc::UnboundedSender<RunnerMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    let runner = JobRunner {
        id,
        mailbox_tx: tx.clone(),
        events,
        directory,
        callback,
        assignment: None,
    };
    tokio::spawn(runner.run(rx));
    tx
}

impl JobRunner {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<RunnerMessage>) {
        while let Some(message) = mailbox.recv().await {
            match message {
                RunnerMessage::Run {
                    container_id,
                    diagnosing,
                } => {
                    self.start_job(container_id, diagnosing).await;
                }
                RunnerMessage::Suspend => match &self.assignment {
                    Some(assignment) => {
                        if let Err(err) = assignment.worker.suspend().await {
                            warn!(
                                runner = %self.id,
                                container_id = %assignment.container_id,
                                error = %err,
                                "worker refused suspend"
                            );
                        }
                    }
                    None => debug!(runner = %self.id, "suspend with no assignment, ignoring"),
                },
                RunnerMessage::Resume => match &self.assignment {
                    Some(assignment) => {
                        if let Err(err) = assignment.worker.resume().await {
                            warn!(
                                runner = %self.id,
                                container_id = %assignment.container_id,
                                error = %err,
                                "worker refused resume"
                            );
                        }
                    }
                    None => debug!(runner = %self.id, "resume with no assignment, ignoring"),
                },
                RunnerMessage::Finish { report } => match &self.assignment {
                    // The assignment survives the finish: the controller
                    // either reassigns this runner or stops it.
                    Some(assignment) => {
                        let _ = self.events.send(RunnerEvent::Finish {
                            runner: self.id,
                            container_id: assignment.container_id.clone(),
                            report,
                        });
                    }
                    None => warn!(runner = %self.id, "finish with no assignment, dropping"),
                },
                RunnerMessage::Lock { container_id } => {
                    let _ = self.events.send(RunnerEvent::Lock { container_id });
                }
                RunnerMessage::Stop => break,
            }
        }
        debug!(runner = %self.id, "job runner stopped");
    }

    async fn start_job(&mut self, container_id: ContainerId, diagnosing: bool) {
        let Some(worker) = self.directory.get(&container_id) else {
            warn!(
                runner = %self.id,
                container_id = %container_id,
                "dispatched container not in directory"
            );
            let report = CompactionReport::empty(container_id.clone(), diagnosing)
                .with_error("container not in directory");
            let _ = self.events.send(RunnerEvent::Finish {
                runner: self.id,
                container_id,
                report,
            });
            return;
        };
        let compaction = worker.compaction_worker();
        let runner_ref = RunnerRef::new(self.mailbox_tx.clone());
        match compaction
            .run(runner_ref, diagnosing, self.callback.clone())
            .await
        {
            Ok(()) => {
                debug!(
                    runner = %self.id,
                    container_id = %container_id,
                    diagnosing,
                    "job started"
                );
                self.assignment = Some(Assignment {
                    container_id,
                    worker: compaction,
                });
            }
            Err(err) => {
                warn!(
                    runner = %self.id,
                    container_id = %container_id,
                    error = %err,
                    "worker failed to start, reporting job as failed"
                );
                let report = CompactionReport::empty(container_id.clone(), diagnosing)
                    .with_error(err.to_string());
                let _ = self.events.send(RunnerEvent::Finish {
                    runner: self.id,
                    container_id,
                    report,
                });
            }
        }
    }
}
