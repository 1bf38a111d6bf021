//! Request front-end: addresses a container from an object key.
//!
//! Single-object operations fingerprint `(addr_id, key)` and forward to the
//! one container the directory picks. Fan-out queries walk every container
//! in directory order with partial-success semantics: a failing container
//! contributes nothing, the rest still answer.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    directory::ContainerDirectory,
    error::RouteError,
    worker::{ObjectSummary, ObjectWorker, PutRequest, PutResponse, StoreRequest, WorkerStats},
};

/// Stateless router over a shared container directory.
#[derive(Clone)]
pub struct RequestRouter {
    directory: Arc<ContainerDirectory>,
}

impl RequestRouter {
    pub fn new(directory: Arc<ContainerDirectory>) -> Self {
        Self { directory }
    }

    /// Canonical byte fingerprint of an object address: the big-endian ring
    /// address followed by the raw key bytes.
    fn fingerprint(addr_id: u128, key: &[u8]) -> Vec<u8> {
        let mut fingerprint = Vec::with_capacity(16 + key.len());
        fingerprint.extend_from_slice(&addr_id.to_be_bytes());
        fingerprint.extend_from_slice(key);
        fingerprint
    }

    fn pick(&self, addr_id: u128, key: &[u8]) -> Result<Arc<dyn ObjectWorker>, RouteError> {
        self.directory
            .pick(&Self::fingerprint(addr_id, key))
            .ok_or(RouteError::ProcessNotFound)
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutResponse, RouteError> {
        let worker = self.pick(request.addr_id, &request.key)?;
        Ok(worker.put(request).await?)
    }

    pub async fn get(&self, addr_id: u128, key: &[u8]) -> Result<Option<Bytes>, RouteError> {
        let worker = self.pick(addr_id, key)?;
        Ok(worker.get(addr_id, key).await?)
    }

    pub async fn delete(&self, addr_id: u128, key: &[u8]) -> Result<(), RouteError> {
        let worker = self.pick(addr_id, key)?;
        Ok(worker.delete(addr_id, key).await?)
    }

    pub async fn head(
        &self,
        addr_id: u128,
        key: &[u8],
    ) -> Result<Option<ObjectSummary>, RouteError> {
        let worker = self.pick(addr_id, key)?;
        Ok(worker.head(addr_id, key).await?)
    }

    pub async fn head_with_md5(
        &self,
        addr_id: u128,
        key: &[u8],
    ) -> Result<Option<ObjectSummary>, RouteError> {
        let worker = self.pick(addr_id, key)?;
        Ok(worker.head_with_md5(addr_id, key).await?)
    }

    pub async fn store(&self, request: StoreRequest) -> Result<(), RouteError> {
        let worker = self.pick(request.addr_id, &request.key)?;
        Ok(worker.store(request).await?)
    }

    /// Fan out across all containers, concatenating in directory order and
    /// truncating to `max_keys` if supplied.
    pub async fn fetch_by_addr_id(
        &self,
        addr_id: u128,
        max_keys: Option<usize>,
    ) -> Result<Vec<ObjectSummary>, RouteError> {
        if self.directory.is_empty() {
            return Err(RouteError::NotFound);
        }
        let mut summaries = Vec::new();
        for worker in self.directory.all() {
            match worker.fetch_by_addr_id(addr_id, max_keys).await {
                Ok(batch) => summaries.extend(batch),
                Err(err) => {
                    tracing::debug!(
                        container_id = %worker.container_id(),
                        error = %err,
                        "fetch_by_addr_id fan-out leg failed, skipping"
                    );
                }
            }
        }
        if let Some(max_keys) = max_keys {
            summaries.truncate(max_keys);
        }
        Ok(summaries)
    }

    /// Fan out a key lookup across all containers; same semantics as
    /// [`fetch_by_addr_id`](Self::fetch_by_addr_id).
    pub async fn fetch_by_key(
        &self,
        key: &[u8],
        max_keys: Option<usize>,
    ) -> Result<Vec<ObjectSummary>, RouteError> {
        if self.directory.is_empty() {
            return Err(RouteError::NotFound);
        }
        let mut summaries = Vec::new();
        for worker in self.directory.all() {
            match worker.fetch_by_key(key, max_keys).await {
                Ok(batch) => summaries.extend(batch),
                Err(err) => {
                    tracing::debug!(
                        container_id = %worker.container_id(),
                        error = %err,
                        "fetch_by_key fan-out leg failed, skipping"
                    );
                }
            }
        }
        if let Some(max_keys) = max_keys {
            summaries.truncate(max_keys);
        }
        Ok(summaries)
    }

    /// Storage stats from every container, directory order; failing legs are
    /// skipped.
    pub async fn stats(&self) -> Vec<WorkerStats> {
        let mut all_stats = Vec::with_capacity(self.directory.len());
        for worker in self.directory.all() {
            match worker.get_stats().await {
                Ok(stats) => all_stats.push(stats),
                Err(err) => {
                    tracing::debug!(
                        container_id = %worker.container_id(),
                        error = %err,
                        "get_stats fan-out leg failed, skipping"
                    );
                }
            }
        }
        all_stats
    }
}
