//! Compaction controller for the container fleet.
//!
//! Single-instance state machine coordinating per-container compaction
//! workers: it admits run requests, enforces the concurrency cap, dispatches
//! jobs to Job Runner tasks, accepts suspend/resume/lock signals, aggregates
//! reports, and returns to idling once every dispatched job has finished.
//!
//! **"One brain, many hands"**: the controller is the single sequential
//! decision-maker; runners and workers are parallel tasks that report back
//! via mpsc channels. All mutable run state lives inside the controller
//! task.

pub mod events;
pub mod handle;
pub(crate) mod runner;
pub mod types;

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use self::{events::RunOptions, handle::ControllerHandle};
use self::{
    events::{ControlCommand, RunnerEvent},
    runner::RunnerMessage,
    types::{CompactionStats, RunStatus, RunnerId},
};
use crate::{
    directory::{ContainerDirectory, ContainerId},
    error::ControlError,
    metrics::ControlPlaneMetrics,
    report::CompactionReport,
    worker::CompactionCallback,
};

/// Whether the event loop keeps going after handling a message.
enum Flow {
    Continue,
    Shutdown,
}

struct RunnerSlot {
    tx: mpsc::UnboundedSender<RunnerMessage>,
    /// True while the runner owns a container; false when idle awaiting
    /// reassignment (suspend-with-pending case).
    has_job: bool,
}

/// The controller singleton. Construct with [`CompactionController::spawn`];
/// all interaction goes through the returned [`ControllerHandle`].
pub struct CompactionController {
    directory: Arc<ContainerDirectory>,
    metrics: Arc<ControlPlaneMetrics>,

    // -- Run state --
    status: RunStatus,
    total_targets: usize,
    reserved: Vec<ContainerId>,
    pending: VecDeque<ContainerId>,
    ongoing: Vec<ContainerId>,
    locked: Vec<ContainerId>,
    runners: BTreeMap<RunnerId, RunnerSlot>,
    next_runner_id: u64,
    max_concurrent: usize,
    diagnosing: bool,
    callback: Option<CompactionCallback>,
    start_time: u64,
    reports: Vec<CompactionReport>,

    // -- Channels --
    command_rx: mpsc::UnboundedReceiver<ControlCommand>,
    event_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    event_tx: mpsc::UnboundedSender<RunnerEvent>,

    // -- Shutdown --
    cancel_token: CancellationToken,
}

impl CompactionController {
    /// Spawn the controller as a task. Boots idling with `pending` holding
    /// every container in the directory.
    pub fn spawn(
        directory: Arc<ContainerDirectory>,
        metrics: Arc<ControlPlaneMetrics>,
        cancel_token: CancellationToken,
    ) -> ControllerHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let controller = Self {
            total_targets: directory.len(),
            pending: directory.container_ids().into_iter().collect(),
            directory,
            metrics,
            status: RunStatus::Idling,
            reserved: Vec::new(),
            ongoing: Vec::new(),
            locked: Vec::new(),
            runners: BTreeMap::new(),
            next_runner_id: 0,
            max_concurrent: 1,
            diagnosing: false,
            callback: None,
            start_time: 0,
            reports: Vec::new(),
            command_rx,
            event_rx,
            event_tx: event_tx.clone(),
            cancel_token,
        };

        tokio::spawn(controller.run());

        ControllerHandle {
            command_tx,
            event_tx,
        }
    }

    /// Main event loop: one message processed to completion before the next.
    async fn run(mut self) {
        info!(
            total_targets = self.total_targets,
            "compaction controller started"
        );
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("compaction controller cancelled, shutting down");
                    break;
                }
                Some(command) = self.command_rx.recv() => {
                    if matches!(self.handle_command(command), Flow::Shutdown) {
                        break;
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    if matches!(self.handle_event(event), Flow::Shutdown) {
                        break;
                    }
                }
            }
        }
        info!("compaction controller stopped");
    }

    fn handle_command(&mut self, command: ControlCommand) -> Flow {
        match command {
            ControlCommand::Run {
                options,
                diagnosing,
                reply,
            } => {
                let result = self.admit_run(options, diagnosing);
                let _ = reply.send(result);
                Flow::Continue
            }
            ControlCommand::Suspend { reply } => {
                let _ = reply.send(self.handle_suspend());
                Flow::Continue
            }
            ControlCommand::Resume { reply } => {
                let _ = reply.send(self.handle_resume());
                Flow::Continue
            }
            ControlCommand::State { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            ControlCommand::Stop { reply } => {
                info!("controller stop requested");
                let _ = reply.send(());
                Flow::Shutdown
            }
        }
    }

    fn handle_event(&mut self, event: RunnerEvent) -> Flow {
        match event {
            RunnerEvent::Lock { container_id } => {
                self.handle_lock(container_id);
                Flow::Continue
            }
            RunnerEvent::Finish {
                runner,
                container_id,
                report,
            } => self.handle_finish(runner, container_id, report),
        }
    }

    fn badstate(&self) -> ControlError {
        self.metrics.counters.badstate_replies.add(1, &[]);
        ControlError::BadState(self.status)
    }

    fn admit_run(&mut self, options: RunOptions, diagnosing: bool) -> Result<(), ControlError> {
        if self.status != RunStatus::Idling {
            return Err(self.badstate());
        }

        let snapshot = self.directory.container_ids();
        let (pending, reserved) = match options.targets {
            // An unqualified run compacts everything; nothing is carried
            // over to the next pass.
            None => (snapshot, Vec::new()),
            Some(targets) => {
                let targets: Vec<ContainerId> = targets
                    .into_iter()
                    .filter(|id| {
                        let known = snapshot.contains(id);
                        if !known {
                            warn!(container_id = %id, "run target not in directory, skipping");
                        }
                        known
                    })
                    .collect();
                let base: Vec<ContainerId> = if self.pending.is_empty() {
                    snapshot
                } else {
                    self.pending.iter().cloned().collect()
                };
                let reserved = base
                    .into_iter()
                    .filter(|id| !targets.contains(id))
                    .collect();
                (targets, reserved)
            }
        };

        self.pending = pending.into_iter().collect();
        self.reserved = reserved;
        self.reports.clear();
        self.locked.clear();
        self.start_time = unix_now_secs();
        self.max_concurrent = options.max_concurrent.max(1);
        self.diagnosing = diagnosing;
        self.callback = options.callback;
        self.status = RunStatus::Running;
        self.metrics.counters.runs_admitted.add(1, &[]);
        info!(
            pending = self.pending.len(),
            reserved = self.reserved.len(),
            max_concurrent = self.max_concurrent,
            diagnosing,
            "compaction run admitted"
        );

        self.start_jobs_as_possible();
        if self.ongoing.is_empty() {
            // Nothing was dispatchable; the run completes on admission.
            self.complete_run();
        }
        Ok(())
    }

    /// Spawn min(max_concurrent, |pending|) runners, one pending target
    /// each. There is no later up-sizing within a run.
    fn start_jobs_as_possible(&mut self) {
        let slots = self.max_concurrent.min(self.pending.len());
        for _ in 0..slots {
            let runner_id = RunnerId(self.next_runner_id);
            self.next_runner_id += 1;
            let tx = runner::spawn(
                runner_id,
                self.event_tx.clone(),
                self.directory.clone(),
                self.callback.clone(),
            );
            self.runners.insert(runner_id, RunnerSlot { tx, has_job: false });
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(runner_id, next);
        }
    }

    fn dispatch(&mut self, runner_id: RunnerId, container_id: ContainerId) {
        let Some(slot) = self.runners.get_mut(&runner_id) else {
            return;
        };
        let _ = slot.tx.send(RunnerMessage::Run {
            container_id: container_id.clone(),
            diagnosing: self.diagnosing,
        });
        slot.has_job = true;
        self.ongoing.push(container_id);
        self.metrics.counters.jobs_dispatched.add(1, &[]);
    }

    fn handle_suspend(&mut self) -> Result<(), ControlError> {
        if self.status != RunStatus::Running {
            return Err(self.badstate());
        }
        for slot in self.runners.values() {
            let _ = slot.tx.send(RunnerMessage::Suspend);
        }
        self.status = RunStatus::Suspending;
        self.metrics.counters.suspends.add(1, &[]);
        info!("compaction suspended");
        Ok(())
    }

    fn handle_resume(&mut self) -> Result<(), ControlError> {
        if self.status != RunStatus::Suspending {
            return Err(self.badstate());
        }
        if self.pending.is_empty() {
            // Nothing to redispatch; in-flight workers stay
            // paused-but-reachable.
            self.status = RunStatus::Running;
        } else {
            let runner_ids: Vec<RunnerId> = self.runners.keys().copied().collect();
            for runner_id in runner_ids {
                let has_job = self
                    .runners
                    .get(&runner_id)
                    .is_some_and(|slot| slot.has_job);
                if has_job {
                    if let Some(slot) = self.runners.get(&runner_id) {
                        let _ = slot.tx.send(RunnerMessage::Resume);
                    }
                } else if let Some(next) = self.pending.pop_front() {
                    self.dispatch(runner_id, next);
                } else {
                    self.stop_runner(runner_id);
                }
            }
            self.status = RunStatus::Running;
        }
        self.metrics.counters.resumes.add(1, &[]);
        info!("compaction resumed");
        Ok(())
    }

    fn handle_lock(&mut self, container_id: ContainerId) {
        match self.status {
            RunStatus::Running => {
                if !self.locked.contains(&container_id) {
                    debug!(container_id = %container_id, "container locked for the current run");
                    self.locked.push(container_id);
                    self.metrics.counters.locks_observed.add(1, &[]);
                }
            }
            _ => {
                debug!(
                    container_id = %container_id,
                    status = %self.status,
                    "lock outside a running state, dropping"
                );
            }
        }
    }

    fn handle_finish(
        &mut self,
        runner: RunnerId,
        container_id: ContainerId,
        report: CompactionReport,
    ) -> Flow {
        match self.status {
            RunStatus::Idling => {
                error!(
                    runner = %runner,
                    container_id = %container_id,
                    "finish while idling: protocol violation, stopping controller"
                );
                Flow::Shutdown
            }
            RunStatus::Running => {
                self.metrics.counters.reports_collected.add(1, &[]);
                self.metrics
                    .histograms
                    .job_duration_ms
                    .record(report.duration_ms, &[]);
                self.ongoing.retain(|id| id != &container_id);
                self.reports.push(report);
                if let Some(next) = self.pending.pop_front() {
                    self.dispatch(runner, next);
                } else if !self.ongoing.is_empty() {
                    self.stop_runner(runner);
                } else {
                    self.complete_run();
                }
                Flow::Continue
            }
            RunStatus::Suspending => {
                // Reports are not accumulated while suspending.
                self.ongoing.retain(|id| id != &container_id);
                if !self.pending.is_empty() {
                    if let Some(slot) = self.runners.get_mut(&runner) {
                        slot.has_job = false;
                    }
                } else if !self.ongoing.is_empty() {
                    self.stop_runner(runner);
                } else {
                    self.complete_run();
                }
                Flow::Continue
            }
        }
    }

    fn stop_runner(&mut self, runner: RunnerId) {
        if let Some(slot) = self.runners.remove(&runner) {
            let _ = slot.tx.send(RunnerMessage::Stop);
        }
    }

    /// Run-completion boundary: stop remaining runners, freeze the sorted
    /// report list, and queue the reserved set (or a fresh directory
    /// snapshot) for the next pass.
    fn complete_run(&mut self) {
        for (_, slot) in std::mem::take(&mut self.runners) {
            let _ = slot.tx.send(RunnerMessage::Stop);
        }
        self.ongoing.clear();
        self.locked.clear();
        self.callback = None;
        self.reports.sort();
        self.pending = self.pending_targets().into_iter().collect();
        self.reserved.clear();
        self.status = RunStatus::Idling;
        let duration_secs = unix_now_secs().saturating_sub(self.start_time);
        self.metrics
            .histograms
            .run_duration_seconds
            .record(duration_secs as f64, &[]);
        info!(
            reports = self.reports.len(),
            next_pending = self.pending.len(),
            duration_secs,
            "compaction run completed"
        );
    }

    fn pending_targets(&self) -> Vec<ContainerId> {
        if self.reserved.is_empty() {
            self.directory.container_ids()
        } else {
            self.reserved.clone()
        }
    }

    fn snapshot(&self) -> CompactionStats {
        CompactionStats {
            status: self.status,
            total_targets: self.total_targets,
            reserved_count: self.reserved.len(),
            pending_count: self.pending.len(),
            ongoing_count: self.ongoing.len(),
            reserved: self.reserved.clone(),
            pending: self.pending.iter().cloned().collect(),
            ongoing: self.ongoing.clone(),
            locked: self.locked.clone(),
            start_time: self.start_time,
            reports: self.reports.clone(),
        }
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{runner::RunnerRef, *};
    use crate::worker::{
        CompactionWorker, ObjectSummary, ObjectWorker, PutRequest, PutResponse, StoreRequest,
        WorkerStats,
    };

    /// Dispatch observed by a scripted worker; the held `RunnerRef` lets the
    /// test decide exactly when the job finishes.
    struct StartedJob {
        container_id: ContainerId,
        diagnosing: bool,
        runner: RunnerRef,
    }

    struct ScriptedCompactionWorker {
        id: ContainerId,
        started: mpsc::UnboundedSender<StartedJob>,
        suspends: Arc<AtomicUsize>,
        resumes: Arc<AtomicUsize>,
        fail_start: bool,
    }

    #[async_trait]
    impl CompactionWorker for ScriptedCompactionWorker {
        async fn run(
            &self,
            runner: RunnerRef,
            diagnosing: bool,
            callback: Option<CompactionCallback>,
        ) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("container offline");
            }
            if let Some(callback) = &callback {
                callback(&CompactionReport::empty(self.id.clone(), diagnosing));
            }
            let _ = self.started.send(StartedJob {
                container_id: self.id.clone(),
                diagnosing,
                runner,
            });
            Ok(())
        }

        async fn suspend(&self) -> Result<()> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Object worker whose request surface is never exercised here; only the
    /// compaction side matters to the controller.
    struct ScriptedObjectWorker {
        id: ContainerId,
        compaction: Arc<ScriptedCompactionWorker>,
    }

    #[async_trait]
    impl ObjectWorker for ScriptedObjectWorker {
        fn container_id(&self) -> &ContainerId {
            &self.id
        }

        async fn put(&self, _request: PutRequest) -> Result<PutResponse> {
            anyhow::bail!("not exercised")
        }

        async fn get(&self, _addr_id: u128, _key: &[u8]) -> Result<Option<Bytes>> {
            anyhow::bail!("not exercised")
        }

        async fn delete(&self, _addr_id: u128, _key: &[u8]) -> Result<()> {
            anyhow::bail!("not exercised")
        }

        async fn head(&self, _addr_id: u128, _key: &[u8]) -> Result<Option<ObjectSummary>> {
            anyhow::bail!("not exercised")
        }

        async fn head_with_md5(
            &self,
            _addr_id: u128,
            _key: &[u8],
        ) -> Result<Option<ObjectSummary>> {
            anyhow::bail!("not exercised")
        }

        async fn store(&self, _request: StoreRequest) -> Result<()> {
            anyhow::bail!("not exercised")
        }

        async fn fetch_by_addr_id(
            &self,
            _addr_id: u128,
            _max_keys: Option<usize>,
        ) -> Result<Vec<ObjectSummary>> {
            anyhow::bail!("not exercised")
        }

        async fn fetch_by_key(
            &self,
            _key: &[u8],
            _max_keys: Option<usize>,
        ) -> Result<Vec<ObjectSummary>> {
            anyhow::bail!("not exercised")
        }

        async fn get_stats(&self) -> Result<WorkerStats> {
            anyhow::bail!("not exercised")
        }

        fn compaction_worker(&self) -> Arc<dyn CompactionWorker> {
            self.compaction.clone()
        }
    }

    struct Fixture {
        handle: ControllerHandle,
        started_rx: mpsc::UnboundedReceiver<StartedJob>,
        suspends: Arc<AtomicUsize>,
        resumes: Arc<AtomicUsize>,
        ids: Vec<ContainerId>,
    }

    fn fixture(containers: usize) -> Fixture {
        fixture_with_failing(containers, None)
    }

    fn fixture_with_failing(containers: usize, failing: Option<usize>) -> Fixture {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let suspends = Arc::new(AtomicUsize::new(0));
        let resumes = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        let workers: Vec<Arc<dyn ObjectWorker>> = (1..=containers)
            .map(|i| {
                let id = ContainerId::new(format!("cask-{i:03}"));
                ids.push(id.clone());
                Arc::new(ScriptedObjectWorker {
                    id: id.clone(),
                    compaction: Arc::new(ScriptedCompactionWorker {
                        id,
                        started: started_tx.clone(),
                        suspends: suspends.clone(),
                        resumes: resumes.clone(),
                        fail_start: failing == Some(i - 1),
                    }),
                }) as Arc<dyn ObjectWorker>
            })
            .collect();
        let directory = Arc::new(ContainerDirectory::from_workers(workers));
        let handle = CompactionController::spawn(
            directory,
            Arc::new(ControlPlaneMetrics::new()),
            CancellationToken::new(),
        );
        Fixture {
            handle,
            started_rx,
            suspends,
            resumes,
            ids,
        }
    }

    fn finish(job: &StartedJob) {
        job.runner
            .finish(CompactionReport::empty(job.container_id.clone(), job.diagnosing));
    }

    async fn next_started(rx: &mut mpsc::UnboundedReceiver<StartedJob>) -> StartedJob {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a dispatch")
            .expect("controller dropped the started channel")
    }

    async fn no_started(rx: &mut mpsc::UnboundedReceiver<StartedJob>) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "unexpected dispatch");
    }

    async fn await_idle(handle: &ControllerHandle) -> CompactionStats {
        for _ in 0..200 {
            let stats = handle.state().await.expect("state query failed");
            if stats.status == RunStatus::Idling {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller never returned to idling");
    }

    async fn await_count(counter: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "counter stuck at {} instead of {expected}",
            counter.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn full_run_with_single_slot_walks_the_directory() {
        let mut fx = fixture(4);
        fx.handle.run().await.unwrap();

        for expected in &fx.ids {
            let job = next_started(&mut fx.started_rx).await;
            assert_eq!(&job.container_id, expected);
            assert!(!job.diagnosing);
            finish(&job);
        }

        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 4);
        let reported: Vec<ContainerId> = stats
            .reports
            .iter()
            .map(|r| r.container_id.clone())
            .collect();
        assert_eq!(reported, fx.ids, "reports are sorted at completion");
        assert_eq!(stats.pending, fx.ids, "an unqualified run re-queues everything");
        assert!(stats.reserved.is_empty());
        assert!(stats.ongoing.is_empty());
    }

    #[tokio::test]
    async fn partial_run_carries_the_complement_as_reserved() {
        let mut fx = fixture(4);
        fx.handle
            .run_with(RunOptions {
                targets: Some(vec![fx.ids[0].clone(), fx.ids[2].clone()]),
                max_concurrent: 2,
                callback: None,
            })
            .await
            .unwrap();

        let first = next_started(&mut fx.started_rx).await;
        let second = next_started(&mut fx.started_rx).await;
        let mut dispatched = vec![first.container_id.clone(), second.container_id.clone()];
        dispatched.sort();
        assert_eq!(dispatched, vec![fx.ids[0].clone(), fx.ids[2].clone()]);

        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.status, RunStatus::Running);
        assert_eq!(stats.ongoing_count, 2);
        assert_eq!(stats.reserved, vec![fx.ids[1].clone(), fx.ids[3].clone()]);

        finish(&first);
        finish(&second);

        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 2);
        assert_eq!(
            stats.pending,
            vec![fx.ids[1].clone(), fx.ids[3].clone()],
            "the reserved set becomes the next run's pending set"
        );
        assert!(stats.reserved.is_empty());
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_ongoing() {
        let mut fx = fixture(4);
        fx.handle
            .run_with(RunOptions {
                targets: None,
                max_concurrent: 2,
                callback: None,
            })
            .await
            .unwrap();

        let first = next_started(&mut fx.started_rx).await;
        let second = next_started(&mut fx.started_rx).await;
        no_started(&mut fx.started_rx).await;

        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.ongoing_count, 2);
        assert_eq!(stats.pending_count, 2);

        finish(&first);
        let third = next_started(&mut fx.started_rx).await;
        let stats = fx.handle.state().await.unwrap();
        assert!(stats.ongoing_count <= 2);

        finish(&second);
        let fourth = next_started(&mut fx.started_rx).await;
        finish(&third);
        finish(&fourth);

        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 4);
        no_started(&mut fx.started_rx).await;
    }

    #[tokio::test]
    async fn empty_target_run_completes_on_admission() {
        let mut fx = fixture(4);
        fx.handle
            .run_with(RunOptions {
                targets: Some(Vec::new()),
                max_concurrent: 3,
                callback: None,
            })
            .await
            .unwrap();

        let stats = await_idle(&fx.handle).await;
        assert!(stats.reports.is_empty());
        assert_eq!(stats.pending, fx.ids);
        no_started(&mut fx.started_rx).await;
    }

    #[tokio::test]
    async fn max_concurrency_above_pending_spawns_only_pending() {
        let mut fx = fixture(2);
        fx.handle
            .run_with(RunOptions {
                targets: None,
                max_concurrent: 8,
                callback: None,
            })
            .await
            .unwrap();

        let first = next_started(&mut fx.started_rx).await;
        let second = next_started(&mut fx.started_rx).await;
        no_started(&mut fx.started_rx).await;
        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.ongoing_count, 2);

        finish(&first);
        finish(&second);
        await_idle(&fx.handle).await;
    }

    #[tokio::test]
    async fn control_events_outside_their_state_reply_badstate() {
        let mut fx = fixture(2);

        assert!(matches!(
            fx.handle.suspend().await,
            Err(ControlError::BadState(RunStatus::Idling))
        ));
        assert!(matches!(
            fx.handle.resume().await,
            Err(ControlError::BadState(RunStatus::Idling))
        ));

        fx.handle.run().await.unwrap();
        assert!(matches!(
            fx.handle.run().await,
            Err(ControlError::BadState(RunStatus::Running))
        ));

        fx.handle.suspend().await.unwrap();
        assert!(matches!(
            fx.handle.suspend().await,
            Err(ControlError::BadState(RunStatus::Suspending))
        ));
        fx.handle.resume().await.unwrap();

        let job = next_started(&mut fx.started_rx).await;
        finish(&job);
        let job = next_started(&mut fx.started_rx).await;
        finish(&job);
        await_idle(&fx.handle).await;
    }

    #[tokio::test]
    async fn suspend_resume_roundtrip_redispatches_nothing_extra() {
        let mut fx = fixture(4);
        fx.handle
            .run_with(RunOptions {
                targets: None,
                max_concurrent: 2,
                callback: None,
            })
            .await
            .unwrap();
        let first = next_started(&mut fx.started_rx).await;
        let second = next_started(&mut fx.started_rx).await;

        fx.handle.suspend().await.unwrap();
        await_count(&fx.suspends, 2).await;
        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.status, RunStatus::Suspending);

        fx.handle.resume().await.unwrap();
        await_count(&fx.resumes, 2).await;
        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.status, RunStatus::Running);

        finish(&first);
        finish(&second);
        let third = next_started(&mut fx.started_rx).await;
        let fourth = next_started(&mut fx.started_rx).await;
        finish(&third);
        finish(&fourth);

        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 4, "round trip changed nothing");
    }

    #[tokio::test]
    async fn finish_during_suspension_idles_the_runner_without_a_report() {
        let mut fx = fixture(4);
        fx.handle
            .run_with(RunOptions {
                targets: None,
                max_concurrent: 2,
                callback: None,
            })
            .await
            .unwrap();
        let first = next_started(&mut fx.started_rx).await;
        let second = next_started(&mut fx.started_rx).await;

        fx.handle.suspend().await.unwrap();
        finish(&first);
        // The idle runner must not receive a dispatch while suspending.
        no_started(&mut fx.started_rx).await;
        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.status, RunStatus::Suspending);
        assert_eq!(stats.ongoing, vec![second.container_id.clone()]);

        fx.handle.resume().await.unwrap();
        // The idle runner picks up the next pending target.
        let third = next_started(&mut fx.started_rx).await;
        assert_eq!(third.container_id, fx.ids[2]);

        finish(&second);
        let fourth = next_started(&mut fx.started_rx).await;
        finish(&third);
        finish(&fourth);

        let stats = await_idle(&fx.handle).await;
        // The finish handled while suspending is not accumulated.
        assert_eq!(stats.reports.len(), 3);
        let reported: Vec<ContainerId> = stats
            .reports
            .iter()
            .map(|r| r.container_id.clone())
            .collect();
        assert_eq!(reported, fx.ids[1..].to_vec());
    }

    #[tokio::test]
    async fn resume_with_nothing_pending_leaves_workers_paused() {
        let mut fx = fixture(2);
        fx.handle
            .run_with(RunOptions {
                targets: None,
                max_concurrent: 2,
                callback: None,
            })
            .await
            .unwrap();
        let first = next_started(&mut fx.started_rx).await;
        let second = next_started(&mut fx.started_rx).await;

        fx.handle.suspend().await.unwrap();
        await_count(&fx.suspends, 2).await;

        fx.handle.resume().await.unwrap();
        let stats = fx.handle.state().await.unwrap();
        assert_eq!(stats.status, RunStatus::Running);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fx.resumes.load(Ordering::SeqCst),
            0,
            "no redispatch with empty pending: workers stay paused-but-reachable"
        );

        finish(&first);
        finish(&second);
        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 2);
    }

    #[tokio::test]
    async fn diagnose_dispatches_read_only_passes() {
        let mut fx = fixture(3);
        fx.handle.diagnose().await.unwrap();

        for _ in 0..3 {
            let job = next_started(&mut fx.started_rx).await;
            assert!(job.diagnosing);
            finish(&job);
        }
        let stats = await_idle(&fx.handle).await;
        assert!(stats.reports.iter().all(|r| r.diagnosed));
    }

    #[tokio::test]
    async fn lock_is_informational_and_cleared_at_completion() {
        let mut fx = fixture(2);
        fx.handle.run().await.unwrap();
        let first = next_started(&mut fx.started_rx).await;

        // A worker can lock any container, including one that is not
        // ongoing; the runner forwards it. Operators can lock directly.
        first.runner.lock(fx.ids[1].clone());
        fx.handle.lock(fx.ids[0].clone());
        let mut locked = Vec::new();
        for _ in 0..100 {
            let stats = fx.handle.state().await.unwrap();
            locked = stats.locked.clone();
            if locked.len() == 2 {
                assert_eq!(stats.ongoing, vec![fx.ids[0].clone()]);
                assert_eq!(stats.pending, vec![fx.ids[1].clone()]);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        locked.sort();
        assert_eq!(locked, fx.ids);

        finish(&first);
        let second = next_started(&mut fx.started_rx).await;
        finish(&second);
        let stats = await_idle(&fx.handle).await;
        assert!(stats.locked.is_empty());
    }

    #[tokio::test]
    async fn finish_while_idling_is_fatal() {
        let fx = fixture(2);
        fx.handle.finish(
            RunnerId(7),
            fx.ids[0].clone(),
            CompactionReport::empty(fx.ids[0].clone(), false),
        );

        for _ in 0..200 {
            if matches!(fx.handle.state().await, Err(ControlError::Closed)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller survived a finish while idling");
    }

    #[tokio::test]
    async fn two_full_runs_dispatch_each_container_once_per_pass() {
        let mut fx = fixture(3);
        for _ in 0..2 {
            fx.handle.run().await.unwrap();
            let mut dispatched = Vec::new();
            for _ in 0..3 {
                let job = next_started(&mut fx.started_rx).await;
                dispatched.push(job.container_id.clone());
                finish(&job);
            }
            dispatched.sort();
            assert_eq!(dispatched, fx.ids);
            await_idle(&fx.handle).await;
        }
        no_started(&mut fx.started_rx).await;
    }

    #[tokio::test]
    async fn worker_start_failure_is_reported_as_a_failed_job() {
        let mut fx = fixture_with_failing(2, Some(0));
        fx.handle.run().await.unwrap();

        // The first container's worker refuses to start; the runner reports
        // the failure as the job outcome and the run moves on.
        let job = next_started(&mut fx.started_rx).await;
        assert_eq!(job.container_id, fx.ids[1]);
        finish(&job);

        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 2);
        assert!(stats.reports[0].error.is_some());
        assert!(stats.reports[1].error.is_none());
    }

    #[tokio::test]
    async fn stop_shuts_down_the_whole_controller() {
        let fx = fixture(2);
        // The id argument is accepted for compatibility and ignored.
        fx.handle.stop(Some("cask-001")).await.unwrap();

        for _ in 0..200 {
            if matches!(fx.handle.state().await, Err(ControlError::Closed)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller survived stop");
    }

    #[tokio::test]
    async fn unknown_run_targets_are_skipped() {
        let mut fx = fixture(2);
        fx.handle
            .run_with(RunOptions {
                targets: Some(vec![fx.ids[1].clone(), ContainerId::new("cask-999")]),
                max_concurrent: 2,
                callback: None,
            })
            .await
            .unwrap();

        let job = next_started(&mut fx.started_rx).await;
        assert_eq!(job.container_id, fx.ids[1]);
        no_started(&mut fx.started_rx).await;
        finish(&job);

        let stats = await_idle(&fx.handle).await;
        assert_eq!(stats.reports.len(), 1);
        assert_eq!(stats.pending, vec![fx.ids[0].clone()]);
    }

    #[tokio::test]
    async fn callback_is_passed_through_to_the_worker() {
        let mut fx = fixture(1);
        let (callback_tx, mut callback_rx) = mpsc::unbounded_channel();
        let callback: CompactionCallback = Arc::new(move |report: &CompactionReport| {
            let _ = callback_tx.send(report.container_id.clone());
        });
        fx.handle
            .run_with(RunOptions {
                targets: None,
                max_concurrent: 1,
                callback: Some(callback),
            })
            .await
            .unwrap();

        let job = next_started(&mut fx.started_rx).await;
        assert_eq!(callback_rx.recv().await.unwrap(), fx.ids[0]);
        finish(&job);
        await_idle(&fx.handle).await;
    }
}
