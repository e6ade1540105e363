//! Short-circuit block input stream
//!
//! Reads a block straight from its backing file on the local filesystem while
//! holding a read lock on the co-located storage node. Opening a stream
//! acquires three resources in order: a worker connection, the block lock and
//! the file reader. Any failure during open releases what was acquired, newest
//! first; closing the stream unlocks the block before releasing the rest.

use super::local_packet_reader::{LocalPacketReader, release_packet};
use super::packet_in_stream::{PacketInStream, PacketReader, PacketSource};
use crate::closer::{Closeable, Closer};
use crate::context::BlockStoreContext;
use crate::worker_client::BlockWorkerClient;
use blockio_common::{BlockId, Error, InStreamOptions, LockBlockResult, Result, WorkerNetAddress};
use blockio_storage::{AllocatorStats, LocalFileBlockReader, Packet, PacketAllocator};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Packet source over a locally stored block
pub struct LocalBlockSource {
    block_id: BlockId,
    block_size: u64,
    reader: Arc<LocalFileBlockReader>,
    allocator: PacketAllocator,
    packet_size: usize,
}

impl LocalBlockSource {
    pub fn new(
        block_id: BlockId,
        block_size: u64,
        reader: Arc<LocalFileBlockReader>,
        options: &InStreamOptions,
    ) -> Self {
        Self {
            block_id,
            block_size,
            reader,
            allocator: PacketAllocator::new(options.buffer_type()),
            packet_size: options.packet_size(),
        }
    }

    pub fn allocator(&self) -> &PacketAllocator {
        &self.allocator
    }

    pub fn reader(&self) -> &Arc<LocalFileBlockReader> {
        &self.reader
    }
}

impl PacketSource for LocalBlockSource {
    fn create_packet_reader(&self, offset: u64, len: u64) -> Result<Box<dyn PacketReader>> {
        if offset.checked_add(len).is_none_or(|end| end > self.block_size) {
            return Err(Error::OutOfBounds {
                offset,
                length: len,
                size: self.block_size,
            });
        }
        Ok(Box::new(LocalPacketReader::new(
            Arc::clone(&self.reader),
            self.block_id,
            offset,
            len,
            self.packet_size,
            self.allocator.clone(),
        )))
    }

    fn destroy_packet(&self, packet: Packet) {
        release_packet(packet);
    }
}

/// Read lock held on a storage node
///
/// Unlocks at most once, whether released by the stream's close or by the
/// rollback of a failed open.
struct BlockLock {
    client: Arc<dyn BlockWorkerClient>,
    block_id: BlockId,
    released: AtomicBool,
}

impl BlockLock {
    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.unlock_block(self.block_id)
    }
}

impl Closeable for BlockLock {
    fn close(&self) -> Result<()> {
        self.release()
    }
}

/// Everything `open` acquires before the stream exists
struct Acquired {
    lock: Arc<BlockLock>,
    lock_result: LockBlockResult,
    reader: Arc<LocalFileBlockReader>,
}

/// Input stream over a block on the local filesystem
///
/// Not safe for concurrent use. Dropping an open stream closes it and logs
/// any failure; call [`close`](Self::close) to observe unlock errors.
pub struct LocalBlockInStream {
    stream: PacketInStream<LocalBlockSource>,
    lock: Arc<BlockLock>,
    lock_result: LockBlockResult,
    closer: Closer,
    closed: bool,
}

impl LocalBlockInStream {
    /// Lock `block_id` on the worker at `address` and open its backing file
    ///
    /// Fails with `Error::BlockNotLocallyAvailable` when the worker does not
    /// hold the block; callers can fall back to a remote read. On any failure
    /// nothing stays locked or connected.
    pub fn open(
        block_id: BlockId,
        block_size: u64,
        address: &WorkerNetAddress,
        context: &dyn BlockStoreContext,
        options: &InStreamOptions,
    ) -> Result<Self> {
        let mut closer = Closer::new();
        let acquired = match Self::acquire(block_id, address, context, &mut closer) {
            Ok(acquired) => acquired,
            Err(e) => return Err(closer.rethrow(e)),
        };

        if acquired.reader.length() < block_size {
            warn!(
                block_id = %block_id,
                block_size,
                file_length = acquired.reader.length(),
                "block file is shorter than the block"
            );
        }
        debug!(
            block_id = %block_id,
            worker = %address,
            lock_id = acquired.lock_result.lock_id,
            path = %acquired.lock_result.block_path().display(),
            "opened short-circuit block stream"
        );

        let source = LocalBlockSource::new(block_id, block_size, acquired.reader, options);
        Ok(Self {
            stream: PacketInStream::new(block_id, block_size, source),
            lock: acquired.lock,
            lock_result: acquired.lock_result,
            closer,
            closed: false,
        })
    }

    fn acquire(
        block_id: BlockId,
        address: &WorkerNetAddress,
        context: &dyn BlockStoreContext,
        closer: &mut Closer,
    ) -> Result<Acquired> {
        let client = context.create_worker_client(address)?;
        closer.register(client.clone());

        let lock_result = client
            .lock_block(block_id)?
            .ok_or(Error::BlockNotLocallyAvailable { block_id })?;
        debug!(
            block_id = %block_id,
            session = %client.session_id(),
            lock_id = lock_result.lock_id,
            "block locked"
        );
        let lock = Arc::new(BlockLock {
            client: client.clone(),
            block_id,
            released: AtomicBool::new(false),
        });
        closer.register(lock.clone());

        client.access_block(block_id)?;

        let reader = Arc::new(LocalFileBlockReader::open(lock_result.block_path())?);
        closer.register(reader.clone());

        Ok(Acquired {
            lock,
            lock_result,
            reader,
        })
    }

    /// Unlock the block and release the file reader and the connection
    ///
    /// Idempotent. Releases run even when the unlock fails; the unlock error
    /// is returned with any release failures attached.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        debug!(block_id = %self.id(), "closing short-circuit block stream");
        self.stream.close();
        let unlocked = self.lock.release();
        self.closed = true;

        match unlocked {
            Ok(()) => self.closer.close(),
            Err(e) => Err(self.closer.rethrow(e)),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf)
    }

    /// Read at `pos` without moving the stream position
    pub fn positioned_read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.stream.positioned_read(pos, buf)
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.stream.seek(pos)
    }

    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.stream.skip(n)
    }

    pub fn id(&self) -> BlockId {
        self.stream.id()
    }

    pub fn length(&self) -> u64 {
        self.stream.length()
    }

    pub fn pos(&self) -> u64 {
        self.stream.pos()
    }

    pub fn remaining(&self) -> u64 {
        self.stream.remaining()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Lock id granted by the storage node
    pub fn lock_id(&self) -> u64 {
        self.lock_result.lock_id
    }

    /// Backing file of the block
    pub fn block_path(&self) -> &Path {
        self.lock_result.block_path()
    }

    /// Reader over the backing file; closed once the stream is closed
    pub fn file_reader(&self) -> &Arc<LocalFileBlockReader> {
        self.stream.source().reader()
    }

    /// Packet accounting for this stream
    pub fn allocator_stats(&self) -> &AllocatorStats {
        self.stream.source().allocator().stats()
    }
}

impl Drop for LocalBlockInStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(block_id = %self.id(), error = %e, "failed to close block stream on drop");
        }
    }
}

impl std::io::Read for LocalBlockInStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Self::read(self, buf).map_err(Into::into)
    }
}

impl std::io::Seek for LocalBlockInStream {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let pos = self.stream.resolve_seek(from)?;
        Self::seek(self, pos)?;
        Ok(pos)
    }
}
