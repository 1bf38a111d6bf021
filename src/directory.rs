//! Ordered directory of storage containers.
//!
//! The directory maps container ids to their object-worker handles. It is
//! consulted by the request router (hash-based pick) and by the compaction
//! controller (full enumeration at run admission). Membership and ordering
//! are fixed for the lifetime of the process; the controller additionally
//! snapshots the id list at each run boundary so a future mutable directory
//! can slot in without FSM changes.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::worker::ObjectWorker;

/// Identifier of a single storage container, stable for the controller's
/// lifetime. Ordered; directory iteration order derives from it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered container-id → worker-handle map.
pub struct ContainerDirectory {
    entries: BTreeMap<ContainerId, Arc<dyn ObjectWorker>>,
}

impl ContainerDirectory {
    pub fn from_workers(workers: Vec<Arc<dyn ObjectWorker>>) -> Self {
        let entries = workers
            .into_iter()
            .map(|w| (w.container_id().clone(), w))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All worker handles in directory order.
    pub fn all(&self) -> Vec<Arc<dyn ObjectWorker>> {
        self.entries.values().cloned().collect()
    }

    /// All container ids in directory order.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.entries.keys().cloned().collect()
    }

    pub fn get(&self, id: &ContainerId) -> Option<Arc<dyn ObjectWorker>> {
        self.entries.get(id).cloned()
    }

    /// Pick the worker responsible for a request fingerprint.
    ///
    /// The routing index is `CRC32(fingerprint) mod N + 1`, 1-based over the
    /// directory order. Returns `None` when the directory is empty.
    pub fn pick(&self, fingerprint: &[u8]) -> Option<Arc<dyn ObjectWorker>> {
        if self.entries.is_empty() {
            return None;
        }
        let index = crc32fast::hash(fingerprint) as usize % self.entries.len() + 1;
        self.entries.values().nth(index - 1).cloned()
    }

    /// First worker in directory order, for debugging.
    pub fn first(&self) -> Option<Arc<dyn ObjectWorker>> {
        self.entries.values().next().cloned()
    }
}
