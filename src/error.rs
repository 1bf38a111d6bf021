//! Error types for the control plane surfaces.

use thiserror::Error;

use crate::controller::types::RunStatus;

/// Errors surfaced by the request router.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No container matched the fingerprint, or the Directory is empty.
    #[error("no container process matched the request")]
    ProcessNotFound,

    /// A fan-out query ran against an empty Directory.
    #[error("not found")]
    NotFound,

    /// The selected worker failed the forwarded operation.
    #[error(transparent)]
    Worker(#[from] anyhow::Error),
}

/// Errors surfaced by the controller's synchronous control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The event is not valid in the controller's current state.
    #[error("bad state: controller is {0}")]
    BadState(RunStatus),

    /// The controller did not reply within the sync timeout.
    #[error("controller reply timed out")]
    Timeout,

    /// The controller task has shut down.
    #[error("controller is closed")]
    Closed,
}
