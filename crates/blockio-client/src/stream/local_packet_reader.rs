//! Packet reader over a local block file

use super::packet_in_stream::PacketReader;
use blockio_common::{BlockId, Error, Result};
use blockio_storage::{LocalFileBlockReader, Packet, PacketAllocator};
use std::sync::Arc;

/// Retire a packet: free its direct memory, then release the handle
///
/// The handle must not go back to the allocator while its memory is still
/// being freed, so the order matters.
pub fn release_packet(mut packet: Packet) {
    if let Some(buffer) = packet.direct_buffer_mut() {
        buffer.free();
    }
    packet.release();
}

/// Reads one byte range of a local block file as packets
///
/// Packets are at most `packet_size` bytes; the last one may be shorter.
/// Several readers can share one `LocalFileBlockReader`.
pub struct LocalPacketReader {
    reader: Arc<LocalFileBlockReader>,
    block_id: BlockId,
    pos: u64,
    end: u64,
    packet_size: usize,
    allocator: PacketAllocator,
    closed: bool,
}

impl LocalPacketReader {
    pub fn new(
        reader: Arc<LocalFileBlockReader>,
        block_id: BlockId,
        offset: u64,
        len: u64,
        packet_size: usize,
        allocator: PacketAllocator,
    ) -> Self {
        Self {
            reader,
            block_id,
            pos: offset,
            end: offset + len,
            packet_size,
            allocator,
            closed: false,
        }
    }
}

impl PacketReader for LocalPacketReader {
    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        if self.pos >= self.end {
            return Ok(None);
        }
        if self.packet_size == 0 {
            return Err(Error::invalid_argument("packet size must be > 0"));
        }

        let len = usize::try_from(self.end - self.pos)
            .unwrap_or(usize::MAX)
            .min(self.packet_size);
        let mut packet = self.allocator.allocate(len)?;

        let read = match self.reader.read_at(self.pos, packet.as_mut_slice()) {
            Ok(n) => n,
            Err(e) => {
                release_packet(packet);
                return Err(e);
            }
        };
        if read < len {
            release_packet(packet);
            return Err(Error::UnexpectedEof {
                block_id: self.block_id,
                offset: self.pos + read as u64,
                expected: self.end - self.pos - read as u64,
            });
        }

        self.pos += len as u64;
        Ok(Some(packet))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_common::BufferType;
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use tempfile::NamedTempFile;

    fn block_file(len: usize) -> (NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    fn collect(reader: &mut LocalPacketReader) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        while let Some(packet) = reader.read_packet().unwrap() {
            packets.push(packet.as_slice().to_vec());
            release_packet(packet);
        }
        packets
    }

    #[test]
    fn test_packets_cover_range() {
        let (file, data) = block_file(10_000);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());
        let allocator = PacketAllocator::new(BufferType::Heap);

        let mut packets =
            LocalPacketReader::new(reader, BlockId::new(1), 1000, 2500, 1024, allocator);
        let chunks = collect(&mut packets);
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![1024, 1024, 452]
        );
        assert_eq!(chunks.concat(), &data[1000..3500]);
    }

    #[test]
    fn test_direct_packets_released_after_free() {
        let (file, data) = block_file(5000);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());
        let allocator = PacketAllocator::new(BufferType::Direct);

        let mut packets =
            LocalPacketReader::new(reader, BlockId::new(1), 0, 5000, 4096, allocator.clone());
        assert_eq!(collect(&mut packets).concat(), data);

        let stats = allocator.stats();
        assert_eq!(stats.allocated.load(Ordering::Relaxed), 2);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.released_with_live_memory.load(Ordering::Relaxed), 0);
        assert_eq!(stats.direct_bytes_outstanding.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_short_file_is_unexpected_eof() {
        let (file, _) = block_file(100);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());
        let allocator = PacketAllocator::new(BufferType::Direct);

        let mut packets =
            LocalPacketReader::new(reader, BlockId::new(9), 50, 100, 64, allocator.clone());
        let err = packets.read_packet().unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedEof {
                offset: 100,
                expected: 50,
                ..
            }
        ));
        assert_eq!(allocator.stats().outstanding(), 0);
        assert_eq!(
            allocator
                .stats()
                .released_with_live_memory
                .load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_overlapping_readers_share_file() {
        let (file, data) = block_file(4096);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());
        let allocator = PacketAllocator::new(BufferType::Heap);

        let mut a = LocalPacketReader::new(
            Arc::clone(&reader),
            BlockId::new(1),
            0,
            3000,
            512,
            allocator.clone(),
        );
        let mut b = LocalPacketReader::new(reader, BlockId::new(1), 1000, 3096, 700, allocator);

        let first_a = a.read_packet().unwrap().unwrap();
        let chunks_b = collect(&mut b);
        let rest_a = collect(&mut a);

        assert_eq!(first_a.as_slice(), &data[..512]);
        release_packet(first_a);
        assert_eq!(rest_a.concat(), &data[512..3000]);
        assert_eq!(chunks_b.concat(), &data[1000..]);
    }

    #[test]
    fn test_zero_packet_size_rejected() {
        let (file, _) = block_file(64);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());
        let allocator = PacketAllocator::new(BufferType::Heap);

        let mut packets =
            LocalPacketReader::new(reader, BlockId::new(1), 0, 64, 0, allocator.clone());
        assert!(matches!(packets.read_packet(), Err(Error::InvalidArgument(_))));
        assert_eq!(allocator.stats().allocated.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_closed_reader_fails() {
        let (file, _) = block_file(100);
        let reader = Arc::new(LocalFileBlockReader::open(file.path()).unwrap());
        let mut packets = LocalPacketReader::new(
            reader,
            BlockId::new(1),
            0,
            100,
            10,
            PacketAllocator::new(BufferType::Heap),
        );
        packets.close().unwrap();
        assert!(matches!(packets.read_packet(), Err(Error::StreamClosed)));
    }
}
