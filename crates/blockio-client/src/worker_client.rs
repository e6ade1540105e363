//! Storage node (worker) client

use crate::closer::Closeable;
use blockio_common::{BlockId, Error, LockBlockResult, Result, SessionId, WorkerNetAddress};
use blockio_storage::BlockWorker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Connection to a storage node's block lock service
///
/// Each client owns one session on the node. Closing the client ends the
/// session.
pub trait BlockWorkerClient: Closeable {
    /// Address of the storage node
    fn address(&self) -> &WorkerNetAddress;

    /// Session this client holds on the storage node
    fn session_id(&self) -> SessionId;

    /// Lock a block for reading
    ///
    /// `Ok(None)` means the node does not hold the block locally.
    fn lock_block(&self, block_id: BlockId) -> Result<Option<LockBlockResult>>;

    /// Tell the node the block was read (recency bookkeeping)
    fn access_block(&self, block_id: BlockId) -> Result<()>;

    /// Release a lock taken with `lock_block`
    fn unlock_block(&self, block_id: BlockId) -> Result<()>;
}

/// Client for a storage node running in the same process
pub struct InProcessWorkerClient {
    worker: Arc<BlockWorker>,
    session: SessionId,
    closed: AtomicBool,
}

impl InProcessWorkerClient {
    /// Open a session on `worker`
    pub fn connect(worker: Arc<BlockWorker>) -> Self {
        let session = worker.open_session();
        Self {
            worker,
            session,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionFailed(format!(
                "connection to {} is closed",
                self.worker.address()
            )));
        }
        Ok(())
    }
}

impl BlockWorkerClient for InProcessWorkerClient {
    fn address(&self) -> &WorkerNetAddress {
        self.worker.address()
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn lock_block(&self, block_id: BlockId) -> Result<Option<LockBlockResult>> {
        self.check_open()?;
        self.worker.lock_block(self.session, block_id)
    }

    fn access_block(&self, block_id: BlockId) -> Result<()> {
        self.check_open()?;
        self.worker.access_block(block_id)
    }

    fn unlock_block(&self, block_id: BlockId) -> Result<()> {
        self.check_open()?;
        self.worker.unlock_block(self.session, block_id)
    }
}

impl Closeable for InProcessWorkerClient {
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.worker.close_session(self.session);
        debug!(worker = %self.worker.address(), session = %self.session, "closed worker client");
        Ok(())
    }
}
