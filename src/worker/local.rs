//! In-process object worker backed by an in-memory object table.
//!
//! This is the local backend used by the binary's `local` environment and by
//! tests. Deletes are tombstones; overwrites and tombstones accrue garbage
//! that a compaction pass reclaims. Suspension is cooperative: the pass
//! parks at batch boundaries while the pause flag is set.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::sync::{RwLock, watch};

use super::{
    CompactionCallback, CompactionWorker, ObjectSummary, ObjectWorker, PutRequest, PutResponse,
    StoreRequest, WorkerStats,
};
use crate::{controller::runner::RunnerRef, directory::ContainerId, report::CompactionReport};

/// Entries scanned between pause checks during a compaction pass.
const COMPACTION_BATCH: usize = 64;

type ObjectKey = (u128, Bytes);

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    stored_at_ms: u64,
    deleted: bool,
}

struct ContainerCore {
    id: ContainerId,
    objects: RwLock<BTreeMap<ObjectKey, StoredObject>>,
    garbage_bytes: AtomicU64,
    paused: watch::Sender<bool>,
}

impl ContainerCore {
    fn new(id: ContainerId) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            id,
            objects: RwLock::new(BTreeMap::new()),
            garbage_bytes: AtomicU64::new(0),
            paused,
        }
    }

    async fn insert(&self, addr_id: u128, key: Bytes, data: Bytes) -> u64 {
        let size = data.len() as u64;
        let object = StoredObject {
            data,
            stored_at_ms: unix_now_ms(),
            deleted: false,
        };
        let mut objects = self.objects.write().await;
        if let Some(previous) = objects.insert((addr_id, key), object) {
            // The overwritten record stays on the log until compaction.
            self.garbage_bytes
                .fetch_add(previous.data.len() as u64, Ordering::AcqRel);
        }
        size
    }

    async fn wait_if_paused(&self) {
        let mut paused = self.paused.subscribe();
        while *paused.borrow() {
            if paused.changed().await.is_err() {
                return;
            }
        }
    }

    async fn compact(&self, diagnosing: bool) -> CompactionReport {
        let started = Instant::now();
        self.wait_if_paused().await;

        let keys: Vec<ObjectKey> = self.objects.read().await.keys().cloned().collect();
        let mut total_entries = 0u64;
        let mut active_entries = 0u64;
        let mut tombstoned: Vec<ObjectKey> = Vec::new();
        for chunk in keys.chunks(COMPACTION_BATCH) {
            self.wait_if_paused().await;
            let objects = self.objects.read().await;
            for key in chunk {
                let Some(object) = objects.get(key) else {
                    continue;
                };
                total_entries += 1;
                if object.deleted {
                    tombstoned.push(key.clone());
                } else {
                    active_entries += 1;
                }
            }
            drop(objects);
            tokio::task::yield_now().await;
        }

        let reclaimed_bytes = if diagnosing {
            0
        } else {
            let mut objects = self.objects.write().await;
            for key in &tombstoned {
                objects.remove(key);
            }
            self.garbage_bytes.swap(0, Ordering::AcqRel)
        };

        CompactionReport {
            container_id: self.id.clone(),
            diagnosed: diagnosing,
            total_entries,
            active_entries,
            reclaimed_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        }
    }
}

/// Object worker over an in-memory container.
pub struct LocalObjectWorker {
    core: Arc<ContainerCore>,
}

impl LocalObjectWorker {
    pub fn new(id: ContainerId) -> Self {
        Self {
            core: Arc::new(ContainerCore::new(id)),
        }
    }
}

#[async_trait]
impl ObjectWorker for LocalObjectWorker {
    fn container_id(&self) -> &ContainerId {
        &self.core.id
    }

    async fn put(&self, request: PutRequest) -> Result<PutResponse> {
        let size_bytes = self
            .core
            .insert(request.addr_id, request.key, request.data)
            .await;
        Ok(PutResponse { size_bytes })
    }

    async fn get(&self, addr_id: u128, key: &[u8]) -> Result<Option<Bytes>> {
        let objects = self.core.objects.read().await;
        Ok(objects
            .get(&(addr_id, Bytes::copy_from_slice(key)))
            .filter(|object| !object.deleted)
            .map(|object| object.data.clone()))
    }

    async fn delete(&self, addr_id: u128, key: &[u8]) -> Result<()> {
        let mut objects = self.core.objects.write().await;
        if let Some(object) = objects.get_mut(&(addr_id, Bytes::copy_from_slice(key)))
            && !object.deleted
        {
            self.core
                .garbage_bytes
                .fetch_add(object.data.len() as u64, Ordering::AcqRel);
            object.deleted = true;
            object.data = Bytes::new();
        }
        Ok(())
    }

    async fn head(&self, addr_id: u128, key: &[u8]) -> Result<Option<ObjectSummary>> {
        let objects = self.core.objects.read().await;
        Ok(objects
            .get(&(addr_id, Bytes::copy_from_slice(key)))
            .filter(|object| !object.deleted)
            .map(|object| ObjectSummary {
                addr_id,
                key: Bytes::copy_from_slice(key),
                size_bytes: object.data.len() as u64,
                stored_at_ms: object.stored_at_ms,
                md5: None,
            }))
    }

    async fn head_with_md5(&self, addr_id: u128, key: &[u8]) -> Result<Option<ObjectSummary>> {
        let objects = self.core.objects.read().await;
        Ok(objects
            .get(&(addr_id, Bytes::copy_from_slice(key)))
            .filter(|object| !object.deleted)
            .map(|object| ObjectSummary {
                addr_id,
                key: Bytes::copy_from_slice(key),
                size_bytes: object.data.len() as u64,
                stored_at_ms: object.stored_at_ms,
                md5: Some(format!("{:x}", Md5::digest(&object.data))),
            }))
    }

    async fn store(&self, request: StoreRequest) -> Result<()> {
        self.core
            .insert(request.addr_id, request.key, request.encoded)
            .await;
        Ok(())
    }

    async fn fetch_by_addr_id(
        &self,
        addr_id: u128,
        max_keys: Option<usize>,
    ) -> Result<Vec<ObjectSummary>> {
        let objects = self.core.objects.read().await;
        let mut summaries: Vec<ObjectSummary> = objects
            .range((addr_id, Bytes::new())..)
            .take_while(|((entry_addr, _), _)| *entry_addr == addr_id)
            .filter(|(_, object)| !object.deleted)
            .map(|((entry_addr, key), object)| ObjectSummary {
                addr_id: *entry_addr,
                key: key.clone(),
                size_bytes: object.data.len() as u64,
                stored_at_ms: object.stored_at_ms,
                md5: None,
            })
            .collect();
        if let Some(max_keys) = max_keys {
            summaries.truncate(max_keys);
        }
        Ok(summaries)
    }

    async fn fetch_by_key(
        &self,
        key: &[u8],
        max_keys: Option<usize>,
    ) -> Result<Vec<ObjectSummary>> {
        let objects = self.core.objects.read().await;
        let mut summaries: Vec<ObjectSummary> = objects
            .iter()
            .filter(|((_, entry_key), object)| entry_key.as_ref() == key && !object.deleted)
            .map(|((entry_addr, entry_key), object)| ObjectSummary {
                addr_id: *entry_addr,
                key: entry_key.clone(),
                size_bytes: object.data.len() as u64,
                stored_at_ms: object.stored_at_ms,
                md5: None,
            })
            .collect();
        if let Some(max_keys) = max_keys {
            summaries.truncate(max_keys);
        }
        Ok(summaries)
    }

    async fn get_stats(&self) -> Result<WorkerStats> {
        let objects = self.core.objects.read().await;
        let total_entries = objects.len() as u64;
        let mut active_entries = 0u64;
        let mut active_bytes = 0u64;
        for object in objects.values() {
            if !object.deleted {
                active_entries += 1;
                active_bytes += object.data.len() as u64;
            }
        }
        Ok(WorkerStats {
            container_id: self.core.id.clone(),
            total_entries,
            active_entries,
            active_bytes,
            garbage_bytes: self.core.garbage_bytes.load(Ordering::Acquire),
        })
    }

    fn compaction_worker(&self) -> Arc<dyn CompactionWorker> {
        Arc::new(LocalCompactionWorker {
            core: self.core.clone(),
        })
    }
}

/// Compaction side of [`LocalObjectWorker`]; shares the container core.
struct LocalCompactionWorker {
    core: Arc<ContainerCore>,
}

#[async_trait]
impl CompactionWorker for LocalCompactionWorker {
    async fn run(
        &self,
        runner: RunnerRef,
        diagnosing: bool,
        callback: Option<CompactionCallback>,
    ) -> Result<()> {
        let core = self.core.clone();
        tokio::spawn(async move {
            let report = core.compact(diagnosing).await;
            if let Some(callback) = &callback {
                callback(&report);
            }
            runner.finish(report);
        });
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        self.core.paused.send_replace(true);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.core.paused.send_replace(false);
        Ok(())
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::controller::runner::RunnerMessage;

    fn worker() -> LocalObjectWorker {
        LocalObjectWorker::new(ContainerId::new("cask-001"))
    }

    fn put_request(addr_id: u128, key: &str, data: &str) -> PutRequest {
        PutRequest {
            addr_id,
            key: Bytes::copy_from_slice(key.as_bytes()),
            data: Bytes::copy_from_slice(data.as_bytes()),
        }
    }

    async fn finish_report(rx: &mut mpsc::UnboundedReceiver<RunnerMessage>) -> CompactionReport {
        match rx.recv().await {
            Some(RunnerMessage::Finish { report }) => report,
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_get_head_roundtrip() {
        let worker = worker();
        worker.put(put_request(7, "a/b", "hello")).await.unwrap();

        let data = worker.get(7, b"a/b").await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");

        let summary = worker.head(7, b"a/b").await.unwrap().unwrap();
        assert_eq!(summary.size_bytes, 5);
        assert!(summary.md5.is_none());

        let summary = worker.head_with_md5(7, b"a/b").await.unwrap().unwrap();
        assert_eq!(
            summary.md5.as_deref(),
            Some(format!("{:x}", Md5::digest(b"hello")).as_str()),
        );
    }

    #[tokio::test]
    async fn delete_tombstones_and_accrues_garbage() {
        let worker = worker();
        worker.put(put_request(7, "a/b", "hello")).await.unwrap();
        worker.delete(7, b"a/b").await.unwrap();

        assert!(worker.get(7, b"a/b").await.unwrap().is_none());
        assert!(worker.head(7, b"a/b").await.unwrap().is_none());

        let stats = worker.get_stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.active_entries, 0);
        assert_eq!(stats.garbage_bytes, 5);
    }

    #[tokio::test]
    async fn overwrite_accrues_garbage() {
        let worker = worker();
        worker.put(put_request(7, "a/b", "hello")).await.unwrap();
        worker.put(put_request(7, "a/b", "hi")).await.unwrap();

        let stats = worker.get_stats().await.unwrap();
        assert_eq!(stats.active_bytes, 2);
        assert_eq!(stats.garbage_bytes, 5);
    }

    #[tokio::test]
    async fn fetch_by_addr_id_and_key() {
        let worker = worker();
        worker.put(put_request(7, "a/1", "x")).await.unwrap();
        worker.put(put_request(7, "a/2", "y")).await.unwrap();
        worker.put(put_request(9, "a/1", "z")).await.unwrap();
        worker.delete(7, b"a/2").await.unwrap();

        let by_addr = worker.fetch_by_addr_id(7, None).await.unwrap();
        assert_eq!(by_addr.len(), 1);
        assert_eq!(&by_addr[0].key[..], b"a/1");

        let by_key = worker.fetch_by_key(b"a/1", None).await.unwrap();
        assert_eq!(by_key.len(), 2);

        let truncated = worker.fetch_by_key(b"a/1", Some(1)).await.unwrap();
        assert_eq!(truncated.len(), 1);
    }

    #[tokio::test]
    async fn compaction_reclaims_tombstones() {
        let worker = worker();
        worker.put(put_request(7, "a/1", "hello")).await.unwrap();
        worker.put(put_request(7, "a/2", "world")).await.unwrap();
        worker.delete(7, b"a/1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let compaction = worker.compaction_worker();
        compaction
            .run(RunnerRef::new(tx), false, None)
            .await
            .unwrap();

        let report = finish_report(&mut rx).await;
        assert_eq!(report.total_entries, 2);
        assert_eq!(report.active_entries, 1);
        assert_eq!(report.reclaimed_bytes, 5);
        assert!(!report.diagnosed);

        let stats = worker.get_stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.garbage_bytes, 0);
    }

    #[tokio::test]
    async fn diagnosis_mutates_nothing() {
        let worker = worker();
        worker.put(put_request(7, "a/1", "hello")).await.unwrap();
        worker.delete(7, b"a/1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let compaction = worker.compaction_worker();
        compaction
            .run(RunnerRef::new(tx), true, None)
            .await
            .unwrap();

        let report = finish_report(&mut rx).await;
        assert!(report.diagnosed);
        assert_eq!(report.reclaimed_bytes, 0);

        let stats = worker.get_stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.garbage_bytes, 5);
    }

    #[tokio::test]
    async fn suspend_parks_the_pass_until_resume() {
        let worker = worker();
        worker.put(put_request(7, "a/1", "hello")).await.unwrap();

        let compaction = worker.compaction_worker();
        compaction.suspend().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        compaction
            .run(RunnerRef::new(tx), false, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "pass should park while suspended");

        compaction.resume().await.unwrap();
        let report = finish_report(&mut rx).await;
        assert_eq!(report.active_entries, 1);
    }

    #[tokio::test]
    async fn callback_runs_before_finish() {
        let worker = worker();
        worker.put(put_request(7, "a/1", "hello")).await.unwrap();

        let (callback_tx, mut callback_rx) = mpsc::unbounded_channel();
        let callback: CompactionCallback = Arc::new(move |report: &CompactionReport| {
            let _ = callback_tx.send(report.container_id.clone());
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker
            .compaction_worker()
            .run(RunnerRef::new(tx), false, Some(callback))
            .await
            .unwrap();

        let report = finish_report(&mut rx).await;
        assert_eq!(callback_rx.recv().await.unwrap(), report.container_id);
    }
}
