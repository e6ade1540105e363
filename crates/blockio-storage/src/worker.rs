//! Storage-node block lock table
//!
//! A `BlockWorker` tracks which local block files exist, which client
//! sessions hold read locks on them, and when each block was last accessed.
//! Locked blocks are never removed or offered for eviction; unlocked blocks
//! are evicted least recently accessed first.

use blockio_common::{BlockId, Error, LockBlockResult, Result, SessionId, WorkerNetAddress};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A block stored on this node
struct BlockMeta {
    path: PathBuf,
    length: u64,
    /// Logical clock value of the last access notification
    last_access: AtomicU64,
}

/// A read lock held by a session
#[derive(Debug, Clone, Copy)]
struct LockRecord {
    session: SessionId,
    lock_id: u64,
}

#[derive(Default)]
struct LockTable {
    by_block: HashMap<BlockId, Vec<LockRecord>>,
    sessions: HashSet<SessionId>,
}

impl LockTable {
    fn count(&self, block_id: BlockId) -> usize {
        self.by_block.get(&block_id).map_or(0, Vec::len)
    }
}

/// Worker statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub locks_granted: AtomicU64,
    pub lock_misses: AtomicU64,
    pub unlocks: AtomicU64,
    pub accesses: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    /// Locks released because their session ended without unlocking
    pub abandoned_locks: AtomicU64,
}

/// Lock table of one storage node
pub struct BlockWorker {
    address: WorkerNetAddress,
    blocks: RwLock<HashMap<BlockId, BlockMeta>>,
    locks: Mutex<LockTable>,
    next_session: AtomicU64,
    next_lock: AtomicU64,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    stats: WorkerStats,
}

impl BlockWorker {
    pub fn new(address: WorkerNetAddress) -> Self {
        Self {
            address,
            blocks: RwLock::new(HashMap::new()),
            locks: Mutex::new(LockTable::default()),
            next_session: AtomicU64::new(1),
            next_lock: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            stats: WorkerStats::default(),
        }
    }

    pub fn address(&self) -> &WorkerNetAddress {
        &self.address
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register an existing block file with this node
    ///
    /// Returns the block length. Re-registering an unlocked block replaces
    /// its path.
    pub fn add_block(&self, block_id: BlockId, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::Storage(format!("failed to get metadata for {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(Error::Storage(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let mut blocks = self.blocks.write();
        let readers = self.locks.lock().count(block_id);
        if readers > 0 {
            return Err(Error::BlockLocked { block_id, readers });
        }
        blocks.insert(
            block_id,
            BlockMeta {
                path: path.to_path_buf(),
                length: metadata.len(),
                last_access: AtomicU64::new(self.tick()),
            },
        );

        debug!(block_id = %block_id, path = %path.display(), "added block");
        Ok(metadata.len())
    }

    /// Forget a block; fails while any session holds a lock on it
    pub fn remove_block(&self, block_id: BlockId) -> Result<()> {
        let mut blocks = self.blocks.write();
        let readers = self.locks.lock().count(block_id);
        if readers > 0 {
            return Err(Error::BlockLocked { block_id, readers });
        }
        if blocks.remove(&block_id).is_none() {
            return Err(Error::BlockNotFound { block_id });
        }
        debug!(block_id = %block_id, "removed block");
        Ok(())
    }

    /// Start a client session
    pub fn open_session(&self) -> SessionId {
        let session = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.locks.lock().sessions.insert(session);
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        debug!(session = %session, "opened session");
        session
    }

    /// End a client session, releasing every lock it still holds
    ///
    /// Returns the number of locks released on the session's behalf.
    pub fn close_session(&self, session: SessionId) -> usize {
        let mut locks = self.locks.lock();
        if !locks.sessions.remove(&session) {
            return 0;
        }

        let mut abandoned = 0;
        locks.by_block.retain(|_, records| {
            let before = records.len();
            records.retain(|r| r.session != session);
            abandoned += before - records.len();
            !records.is_empty()
        });
        drop(locks);

        self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
        if abandoned > 0 {
            self.stats
                .abandoned_locks
                .fetch_add(abandoned as u64, Ordering::Relaxed);
            warn!(session = %session, abandoned, "session closed while holding block locks");
        } else {
            debug!(session = %session, "closed session");
        }
        abandoned
    }

    /// Take a read lock on a block for `session`
    ///
    /// Returns `None` when the block is not stored on this node.
    pub fn lock_block(
        &self,
        session: SessionId,
        block_id: BlockId,
    ) -> Result<Option<LockBlockResult>> {
        let blocks = self.blocks.read();
        let mut locks = self.locks.lock();
        if !locks.sessions.contains(&session) {
            return Err(Error::invalid_argument(format!("unknown session {session}")));
        }

        let Some(meta) = blocks.get(&block_id) else {
            self.stats.lock_misses.fetch_add(1, Ordering::Relaxed);
            debug!(session = %session, block_id = %block_id, "lock miss");
            return Ok(None);
        };

        let lock_id = self.next_lock.fetch_add(1, Ordering::Relaxed);
        locks
            .by_block
            .entry(block_id)
            .or_default()
            .push(LockRecord { session, lock_id });
        self.stats.locks_granted.fetch_add(1, Ordering::Relaxed);

        debug!(
            session = %session,
            block_id = %block_id,
            lock_id,
            length = meta.length,
            "locked block"
        );
        Ok(Some(LockBlockResult::new(lock_id, meta.path.clone())))
    }

    /// Record that a block was read
    pub fn access_block(&self, block_id: BlockId) -> Result<()> {
        let blocks = self.blocks.read();
        let meta = blocks
            .get(&block_id)
            .ok_or(Error::BlockNotFound { block_id })?;
        meta.last_access.store(self.tick(), Ordering::Relaxed);
        self.stats.accesses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release one lock `session` holds on a block
    pub fn unlock_block(&self, session: SessionId, block_id: BlockId) -> Result<()> {
        let mut locks = self.locks.lock();
        let records = locks
            .by_block
            .get_mut(&block_id)
            .ok_or(Error::LockNotHeld { block_id })?;
        let idx = records
            .iter()
            .position(|r| r.session == session)
            .ok_or(Error::LockNotHeld { block_id })?;
        let record = records.swap_remove(idx);
        if records.is_empty() {
            locks.by_block.remove(&block_id);
        }
        self.stats.unlocks.fetch_add(1, Ordering::Relaxed);

        debug!(
            session = %session,
            block_id = %block_id,
            lock_id = record.lock_id,
            "unlocked block"
        );
        Ok(())
    }

    /// Number of locks currently held on a block
    pub fn lock_count(&self, block_id: BlockId) -> usize {
        self.locks.lock().count(block_id)
    }

    /// Unlocked blocks, least recently accessed first
    pub fn eviction_candidates(&self, limit: usize) -> Vec<BlockId> {
        let blocks = self.blocks.read();
        let locks = self.locks.lock();

        let mut candidates: Vec<(u64, BlockId)> = blocks
            .iter()
            .filter(|(id, _)| locks.count(**id) == 0)
            .map(|(id, meta)| (meta.last_access.load(Ordering::Relaxed), *id))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    /// Log a one-line summary of the lock table
    pub fn log_summary(&self) {
        let blocks = self.blocks.read().len();
        let locks = self.locks.lock();
        let held: usize = locks.by_block.values().map(Vec::len).sum();
        info!(
            worker = %self.address,
            blocks,
            held_locks = held,
            sessions = locks.sessions.len(),
            "block worker summary"
        );
    }
}
