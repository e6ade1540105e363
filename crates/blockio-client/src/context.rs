//! Connection provisioning for block streams

use crate::worker_client::{BlockWorkerClient, InProcessWorkerClient};
use blockio_common::{Error, Result, WorkerNetAddress};
use blockio_storage::BlockWorker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Hands out connections to storage nodes
pub trait BlockStoreContext: Send + Sync {
    /// Connect to the storage node at `address`
    ///
    /// Fails with `Error::ConnectionFailed` when the node cannot be reached.
    fn create_worker_client(&self, address: &WorkerNetAddress)
    -> Result<Arc<dyn BlockWorkerClient>>;
}

/// Context over storage nodes that live in this process
#[derive(Default)]
pub struct LocalWorkerContext {
    workers: RwLock<HashMap<WorkerNetAddress, Arc<BlockWorker>>>,
}

impl LocalWorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a worker reachable at its address
    pub fn register_worker(&self, worker: Arc<BlockWorker>) {
        debug!(worker = %worker.address(), "registered worker");
        self.workers
            .write()
            .insert(worker.address().clone(), worker);
    }

    /// Look up a registered worker
    pub fn worker(&self, address: &WorkerNetAddress) -> Option<Arc<BlockWorker>> {
        self.workers.read().get(address).cloned()
    }
}

impl BlockStoreContext for LocalWorkerContext {
    fn create_worker_client(
        &self,
        address: &WorkerNetAddress,
    ) -> Result<Arc<dyn BlockWorkerClient>> {
        let worker = self
            .worker(address)
            .ok_or_else(|| Error::ConnectionFailed(format!("no worker at {address}")))?;
        Ok(Arc::new(InProcessWorkerClient::connect(worker)))
    }
}
