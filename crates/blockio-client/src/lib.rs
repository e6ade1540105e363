//! BlockIO Client - Short-circuit block reads
//!
//! This crate reads blocks straight from the local filesystem when the
//! client runs next to the storage node that holds them:
//! - Lock coordination with the storage node (`worker_client`, `context`)
//! - Ordered release of partially acquired resources (`closer`)
//! - Packetized block streams (`stream`)

pub mod closer;
pub mod context;
pub mod stream;
pub mod worker_client;

// Re-exports
pub use closer::{Closeable, Closer};
pub use context::{BlockStoreContext, LocalWorkerContext};
pub use stream::{
    LocalBlockInStream, LocalPacketReader, PacketInStream, PacketReader, PacketSource,
};
pub use worker_client::{BlockWorkerClient, InProcessWorkerClient};
