//! Service wiring: directory, controller, monitoring, shutdown.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ControlPlaneConfig,
    controller::{CompactionController, ControllerHandle, RunOptions},
    directory::ContainerDirectory,
    error::ControlError,
    metrics::ControlPlaneMetrics,
    monitoring::{self, MonitoringState},
    router::RequestRouter,
    worker::{ObjectWorker, local::LocalObjectWorker},
};

pub struct Service {
    config: ControlPlaneConfig,
    directory: Arc<ContainerDirectory>,
    metrics: Arc<ControlPlaneMetrics>,
}

impl Service {
    pub fn new(config: ControlPlaneConfig) -> Self {
        let workers: Vec<Arc<dyn ObjectWorker>> = config
            .container_ids()
            .into_iter()
            .map(|id| Arc::new(LocalObjectWorker::new(id)) as Arc<dyn ObjectWorker>)
            .collect();
        let directory = Arc::new(ContainerDirectory::from_workers(workers));
        Self {
            config,
            directory,
            metrics: Arc::new(ControlPlaneMetrics::new()),
        }
    }

    /// Request front-end over this node's directory, for the RPC layer to
    /// embed.
    pub fn router(&self) -> RequestRouter {
        RequestRouter::new(self.directory.clone())
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            node_id = %self.config.node_id,
            containers = self.directory.len(),
            "Starting control plane service"
        );

        let cancel_token = CancellationToken::new();
        let controller = CompactionController::spawn(
            self.directory.clone(),
            self.metrics.clone(),
            cancel_token.clone(),
        );

        let monitoring_state = Arc::new(MonitoringState::new(controller.clone()));
        let monitoring_handle = tokio::spawn({
            let state = monitoring_state.clone();
            let addr = self.config.monitoring_addr.clone();
            let cancel_token = cancel_token.clone();
            async move {
                monitoring::run_monitoring_server(&addr, state, cancel_token).await;
            }
        });

        if let Some(interval_secs) = self.config.auto_compaction_interval_secs {
            tokio::spawn(run_auto_compaction_loop(
                controller.clone(),
                Duration::from_secs(interval_secs),
                self.config.max_compaction_concurrency,
                cancel_token.clone(),
            ));
        }

        monitoring_state.ready.store(true, Ordering::SeqCst);

        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received, cancelling tasks");
                cancel_token.cancel();
            }
            result = monitoring_handle => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "Monitoring task panicked");
                }
                cancel_token.cancel();
            }
        }

        let _ = controller.stop(None).await;
        Ok(())
    }
}

/// Periodically admit an unqualified compaction run. A run already in
/// flight simply skips the tick.
async fn run_auto_compaction_loop(
    controller: ControllerHandle,
    interval: Duration,
    max_concurrent: usize,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick happens after a full interval, not at startup.
    ticker.reset();
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::info!("Auto-compaction loop cancelled");
                return;
            }
            _ = ticker.tick() => {
                match controller
                    .run_with(RunOptions {
                        targets: None,
                        max_concurrent,
                        callback: None,
                    })
                    .await
                {
                    Ok(()) => tracing::info!("Periodic compaction run admitted"),
                    Err(ControlError::BadState(status)) => {
                        tracing::debug!(status = %status, "Run already in flight, skipping tick");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Periodic compaction trigger failed");
                        return;
                    }
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
