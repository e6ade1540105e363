//! Block input streams
//!
//! `PacketInStream` is the generic pull-based reader over a block's packets;
//! `LocalBlockInStream` specializes it for blocks on the local filesystem.

mod local_block_in_stream;
mod local_packet_reader;
mod packet_in_stream;

pub use local_block_in_stream::{LocalBlockInStream, LocalBlockSource};
pub use local_packet_reader::{LocalPacketReader, release_packet};
pub use packet_in_stream::{PacketInStream, PacketReader, PacketSource};
