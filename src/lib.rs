//! Caskstore Compaction Control Plane
//!
//! Coordinates per-container compaction workers across a log-structured
//! object-storage node: run admission, concurrency-capped dispatch,
//! suspend/resume/lock signalling, and report aggregation. Also hosts the
//! CRC-routed request front-end that shares the same container directory.

pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod monitoring;
pub mod report;
pub mod router;
pub mod service;
pub mod worker;

// Re-export key types for convenience
pub use controller::{
    CompactionController, ControllerHandle, RunOptions,
    runner::RunnerRef,
    types::{CompactionStats, RunStatus, RunnerId},
};
pub use directory::{ContainerDirectory, ContainerId};
pub use error::{ControlError, RouteError};
pub use report::CompactionReport;
pub use router::RequestRouter;
pub use service::Service;
pub use worker::{CompactionWorker, ObjectWorker};
