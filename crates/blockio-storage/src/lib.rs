//! BlockIO Storage - Local block access
//!
//! This crate implements the storage-side pieces of short-circuit reads:
//! - Positional reads from a block's backing file
//! - Packet buffers on the heap or in explicitly freed aligned memory
//! - The storage-node lock table with access recency tracking

pub mod buffer;
pub mod packet;
pub mod reader;
pub mod worker;

// Re-exports
pub use buffer::{ALIGNMENT, DirectBuffer};
pub use packet::{AllocatorStats, Packet, PacketAllocator};
pub use reader::LocalFileBlockReader;
pub use worker::{BlockWorker, WorkerStats};
