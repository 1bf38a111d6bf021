//! Contracts between the control plane and the per-container workers.
//!
//! Each storage container is fronted by two handles: an [`ObjectWorker`] for
//! request-level operations (consumed by the router) and a
//! [`CompactionWorker`] for compaction control (consumed by the Job Runner).
//! The compaction worker is reached through the object worker, never
//! constructed independently.

pub mod local;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{controller::runner::RunnerRef, directory::ContainerId, report::CompactionReport};

/// Per-job completion hook, passed through the controller and runner to the
/// worker; invoked by the worker with the finished report.
pub type CompactionCallback = Arc<dyn Fn(&CompactionReport) + Send + Sync>;

/// Object write request.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub addr_id: u128,
    pub key: Bytes,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub size_bytes: u64,
}

/// Replication-path write of an already-encoded object record.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub addr_id: u128,
    pub key: Bytes,
    pub encoded: Bytes,
}

/// Metadata-level view of a stored object, as returned by `head` and the
/// fan-out fetches. `md5` is populated only by `head_with_md5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub addr_id: u128,
    pub key: Bytes,
    pub size_bytes: u64,
    pub stored_at_ms: u64,
    pub md5: Option<String>,
}

/// Storage stats bag returned by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub container_id: ContainerId,
    /// Entries in the container, tombstones included.
    pub total_entries: u64,
    pub active_entries: u64,
    pub active_bytes: u64,
    /// Bytes held by tombstoned or overwritten entries, reclaimable by
    /// compaction.
    pub garbage_bytes: u64,
}

/// Request-level operations exposed by a container's object server.
#[async_trait]
pub trait ObjectWorker: Send + Sync {
    fn container_id(&self) -> &ContainerId;

    async fn put(&self, request: PutRequest) -> Result<PutResponse>;

    /// Returns `None` when the object does not exist or is tombstoned.
    async fn get(&self, addr_id: u128, key: &[u8]) -> Result<Option<Bytes>>;

    async fn delete(&self, addr_id: u128, key: &[u8]) -> Result<()>;

    async fn head(&self, addr_id: u128, key: &[u8]) -> Result<Option<ObjectSummary>>;

    /// Like `head`, with the object's MD5 digest computed on the fly.
    async fn head_with_md5(&self, addr_id: u128, key: &[u8]) -> Result<Option<ObjectSummary>>;

    async fn store(&self, request: StoreRequest) -> Result<()>;

    /// All live objects under the given ring address, directory order.
    async fn fetch_by_addr_id(
        &self,
        addr_id: u128,
        max_keys: Option<usize>,
    ) -> Result<Vec<ObjectSummary>>;

    /// All live objects matching the given key across ring addresses.
    async fn fetch_by_key(&self, key: &[u8], max_keys: Option<usize>)
        -> Result<Vec<ObjectSummary>>;

    async fn get_stats(&self) -> Result<WorkerStats>;

    /// Handle to this container's compaction worker.
    fn compaction_worker(&self) -> Arc<dyn CompactionWorker>;
}

/// Compaction control surface of a single container.
///
/// `run` must return once the pass has been *started*; the pass itself runs
/// in the worker's own task and reports completion asynchronously by sending
/// the finished report through `runner`. The worker invokes `callback`, if
/// any, before reporting.
#[async_trait]
pub trait CompactionWorker: Send + Sync {
    async fn run(
        &self,
        runner: RunnerRef,
        diagnosing: bool,
        callback: Option<CompactionCallback>,
    ) -> Result<()>;

    /// Cooperative pause: the worker parks at its next quiescent point.
    async fn suspend(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;
}
