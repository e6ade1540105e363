//! Packet buffers
//!
//! A packet is a bounded slice of block bytes handed to a reader. Packets are
//! handed out by a `PacketAllocator` and tracked until their handle is
//! released. Direct packets own a `DirectBuffer`, which the destroyer must
//! free before releasing the handle.

use crate::buffer::DirectBuffer;
use blockio_common::{BufferType, Result};
use bytes::BytesMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Packet accounting for one allocator
#[derive(Debug, Default)]
pub struct AllocatorStats {
    /// Packets handed out
    pub allocated: AtomicU64,
    /// Packet handles released
    pub released: AtomicU64,
    /// Direct memory held by packets that have not been released
    pub direct_bytes_outstanding: AtomicU64,
    /// Handles released while their direct memory was still allocated
    pub released_with_live_memory: AtomicU64,
}

impl AllocatorStats {
    /// Packets allocated but not yet released
    pub fn outstanding(&self) -> u64 {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        allocated.saturating_sub(released)
    }
}

/// Hands out packets of the configured buffer type
#[derive(Debug, Clone)]
pub struct PacketAllocator {
    buffer_type: BufferType,
    stats: Arc<AllocatorStats>,
}

impl PacketAllocator {
    pub fn new(buffer_type: BufferType) -> Self {
        Self {
            buffer_type,
            stats: Arc::new(AllocatorStats::default()),
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    /// Allocate a zeroed packet of `len` bytes
    pub fn allocate(&self, len: usize) -> Result<Packet> {
        let buf = match self.buffer_type {
            BufferType::Heap => PacketBuf::Heap(BytesMut::zeroed(len)),
            BufferType::Direct => {
                let buf = DirectBuffer::new(len)?;
                self.stats
                    .direct_bytes_outstanding
                    .fetch_add(buf.capacity() as u64, Ordering::Relaxed);
                PacketBuf::Direct(buf)
            }
        };
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Packet {
            buf,
            stats: Arc::clone(&self.stats),
        })
    }
}

#[derive(Debug)]
enum PacketBuf {
    Heap(BytesMut),
    Direct(DirectBuffer),
}

/// Ownership-tracked packet buffer
#[derive(Debug)]
pub struct Packet {
    buf: PacketBuf,
    stats: Arc<AllocatorStats>,
}

impl Packet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.buf {
            PacketBuf::Heap(b) => &b[..],
            PacketBuf::Direct(b) => b.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.buf {
            PacketBuf::Heap(b) => &mut b[..],
            PacketBuf::Direct(b) => b.as_mut_slice(),
        }
    }

    #[must_use]
    pub const fn is_direct(&self) -> bool {
        matches!(self.buf, PacketBuf::Direct(_))
    }

    /// The direct memory behind this packet, if it has any
    pub fn direct_buffer_mut(&mut self) -> Option<&mut DirectBuffer> {
        match &mut self.buf {
            PacketBuf::Direct(b) => Some(b),
            PacketBuf::Heap(_) => None,
        }
    }

    /// Release the packet handle back to its allocator
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let PacketBuf::Direct(buf) = &self.buf {
            if !buf.is_freed() {
                self.stats
                    .released_with_live_memory
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    bytes = buf.capacity(),
                    "packet released before its direct memory was freed"
                );
            }
            self.stats
                .direct_bytes_outstanding
                .fetch_sub(buf.capacity() as u64, Ordering::Relaxed);
        }
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}
