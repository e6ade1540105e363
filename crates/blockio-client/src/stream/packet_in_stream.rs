//! Packetized block input stream
//!
//! Reads a block of known length as a sequence of packets pulled from a
//! `PacketReader`. The reader for the stream position is created lazily and
//! dropped whenever the position jumps; positioned reads use their own
//! short-lived reader and leave the stream position alone.
//!
//! Every packet the stream takes from a reader is handed back to
//! `PacketSource::destroy_packet` exactly once.

use blockio_common::{BlockId, Error, Result};
use blockio_storage::Packet;
use std::io::SeekFrom;
use tracing::warn;

/// Produces the packets of one byte range
pub trait PacketReader: Send {
    /// Next packet of the range, or `None` once the range is exhausted
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Stop reading; later `read_packet` calls fail
    fn close(&mut self) -> Result<()>;
}

/// Where a `PacketInStream` gets its packets from
pub trait PacketSource {
    /// Create a reader for `[offset, offset + len)` of the block
    fn create_packet_reader(&self, offset: u64, len: u64) -> Result<Box<dyn PacketReader>>;

    /// Retire a packet the stream has finished with
    fn destroy_packet(&self, packet: Packet);
}

/// A packet being consumed
struct CurrentPacket {
    packet: Packet,
    cursor: usize,
}

impl CurrentPacket {
    fn remaining(&self) -> usize {
        self.packet.len() - self.cursor
    }

    fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    fn copy_to(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.packet.as_slice()[self.cursor..self.cursor + n]);
        self.cursor += n;
        n
    }
}

/// Pull-based reader over the packets of one block
///
/// Not safe for concurrent use; share it only behind external
/// synchronization.
pub struct PacketInStream<S: PacketSource> {
    id: BlockId,
    length: u64,
    pos: u64,
    current: Option<CurrentPacket>,
    reader: Option<Box<dyn PacketReader>>,
    source: S,
    closed: bool,
}

impl<S: PacketSource> PacketInStream<S> {
    pub fn new(id: BlockId, length: u64, source: S) -> Self {
        Self {
            id,
            length,
            pos: 0,
            current: None,
            reader: None,
            source,
            closed: false,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Declared block length
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current stream position
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Bytes between the position and the end of the block
    pub fn remaining(&self) -> u64 {
        self.length - self.pos
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StreamClosed);
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the stream position
    ///
    /// Returns 0 only for an empty buffer or at the end of the block.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if buf.is_empty() || self.remaining() == 0 {
            return Ok(0);
        }

        let want = buf
            .len()
            .min(usize::try_from(self.remaining()).unwrap_or(usize::MAX));
        let n = self.current_packet()?.copy_to(&mut buf[..want]);
        self.pos += n as u64;

        if self.remaining() == 0 {
            self.close_packet_reader();
        }
        Ok(n)
    }

    /// Read up to `buf.len()` bytes at `pos` without moving the stream
    /// position
    ///
    /// Returns 0 when `pos` is at or past the end of the block.
    pub fn positioned_read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if buf.is_empty() || pos >= self.length {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(self.length - pos);
        #[allow(clippy::cast_possible_truncation)]
        let buf = &mut buf[..len as usize];

        let mut reader = self.source.create_packet_reader(pos, len)?;
        let result = self.fill_from(reader.as_mut(), pos, buf);
        let closed = reader.close();

        match (result, closed) {
            (Ok(n), Ok(())) => Ok(n),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(c)) => Err(e.with_suppressed(vec![c])),
        }
    }

    /// Fill `buf` from a dedicated reader starting at block offset `pos`
    fn fill_from(&self, reader: &mut dyn PacketReader, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let packet = match reader.read_packet()? {
                Some(packet) if !packet.is_empty() => packet,
                other => {
                    if let Some(packet) = other {
                        self.source.destroy_packet(packet);
                    }
                    return Err(Error::UnexpectedEof {
                        block_id: self.id,
                        offset: pos + filled as u64,
                        expected: (buf.len() - filled) as u64,
                    });
                }
            };
            let n = packet.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&packet.as_slice()[..n]);
            filled += n;
            self.source.destroy_packet(packet);
        }
        Ok(filled)
    }

    /// Move the stream position to `pos` within `[0, length]`
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.check_open()?;
        if pos > self.length {
            return Err(Error::OutOfBounds {
                offset: pos,
                length: 0,
                size: self.length,
            });
        }
        if pos == self.pos {
            return Ok(());
        }

        self.close_packet_reader();
        self.pos = pos;
        Ok(())
    }

    /// Advance the position by up to `n` bytes; returns the bytes skipped
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.check_open()?;
        let to_skip = n.min(self.remaining());
        if to_skip == 0 {
            return Ok(0);
        }

        self.close_packet_reader();
        self.pos += to_skip;
        Ok(to_skip)
    }

    /// Retire the current packet and the packet reader
    ///
    /// Idempotent. Reader close failures are logged: the stream no longer
    /// needs anything from that reader.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.close_packet_reader();
        self.closed = true;
    }

    /// The packet at the stream position, fetching one if needed
    fn current_packet(&mut self) -> Result<&mut CurrentPacket> {
        while self.current.as_ref().is_none_or(CurrentPacket::is_drained) {
            self.destroy_current_packet();

            let reader = match self.reader.take() {
                Some(reader) => reader,
                None => self
                    .source
                    .create_packet_reader(self.pos, self.remaining())?,
            };
            let reader = self.reader.insert(reader);

            match reader.read_packet()? {
                Some(packet) if !packet.is_empty() => {
                    self.current = Some(CurrentPacket { packet, cursor: 0 });
                }
                // an empty packet on a non-empty range would never advance
                other => {
                    if let Some(packet) = other {
                        self.source.destroy_packet(packet);
                    }
                    return Err(Error::UnexpectedEof {
                        block_id: self.id,
                        offset: self.pos,
                        expected: self.remaining(),
                    });
                }
            }
        }

        self.current
            .as_mut()
            .ok_or_else(|| Error::internal("no packet after refill"))
    }

    fn destroy_current_packet(&mut self) {
        if let Some(current) = self.current.take() {
            self.source.destroy_packet(current.packet);
        }
    }

    fn close_packet_reader(&mut self) {
        self.destroy_current_packet();
        if let Some(mut reader) = self.reader.take() {
            if let Err(e) = reader.close() {
                warn!(block_id = %self.id, error = %e, "failed to close packet reader");
            }
        }
    }

    /// Resolve a `SeekFrom` against this stream
    pub fn resolve_seek(&self, from: SeekFrom) -> Result<u64> {
        let target = match from {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::End(offset) => self.length.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
        };
        target.ok_or_else(|| Error::invalid_argument(format!("invalid seek {from:?}")))
    }
}

impl<S: PacketSource> Drop for PacketInStream<S> {
    fn drop(&mut self) {
        self.close_packet_reader();
    }
}

impl<S: PacketSource> std::io::Read for PacketInStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Self::read(self, buf).map_err(Into::into)
    }
}

impl<S: PacketSource> std::io::Seek for PacketInStream<S> {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let pos = self.resolve_seek(from)?;
        Self::seek(self, pos)?;
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_common::BufferType;
    use blockio_storage::PacketAllocator;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Serves a block held in memory, in packets of a fixed size
    struct MemorySource {
        data: Arc<Vec<u8>>,
        packet_size: usize,
        allocator: PacketAllocator,
        /// Stop producing packets at this block offset
        truncate_at: Option<u64>,
        destroyed: Arc<Mutex<usize>>,
        readers_closed: Arc<Mutex<usize>>,
    }

    struct MemoryReader {
        data: Arc<Vec<u8>>,
        pos: u64,
        end: u64,
        packet_size: usize,
        allocator: PacketAllocator,
        readers_closed: Arc<Mutex<usize>>,
    }

    impl PacketReader for MemoryReader {
        fn read_packet(&mut self) -> Result<Option<Packet>> {
            if self.pos >= self.end {
                return Ok(None);
            }
            let start = self.pos as usize;
            let len = self.packet_size.min((self.end - self.pos) as usize);
            let mut packet = self.allocator.allocate(len)?;
            packet
                .as_mut_slice()
                .copy_from_slice(&self.data[start..start + len]);
            self.pos += len as u64;
            Ok(Some(packet))
        }

        fn close(&mut self) -> Result<()> {
            *self.readers_closed.lock() += 1;
            Ok(())
        }
    }

    impl PacketSource for MemorySource {
        fn create_packet_reader(&self, offset: u64, len: u64) -> Result<Box<dyn PacketReader>> {
            let end = self
                .truncate_at
                .map_or(offset + len, |limit| (offset + len).min(limit));
            Ok(Box::new(MemoryReader {
                data: Arc::clone(&self.data),
                pos: offset,
                end,
                packet_size: self.packet_size,
                allocator: self.allocator.clone(),
                readers_closed: Arc::clone(&self.readers_closed),
            }))
        }

        fn destroy_packet(&self, packet: Packet) {
            *self.destroyed.lock() += 1;
            packet.release();
        }
    }

    fn stream(len: usize, packet_size: usize) -> PacketInStream<MemorySource> {
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        let source = MemorySource {
            data: Arc::new(data),
            packet_size,
            allocator: PacketAllocator::new(BufferType::Heap),
            truncate_at: None,
            destroyed: Arc::new(Mutex::new(0)),
            readers_closed: Arc::new(Mutex::new(0)),
        };
        PacketInStream::new(BlockId::new(1), len as u64, source)
    }

    fn expected(range: std::ops::Range<usize>) -> Vec<u8> {
        range.map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_read_across_packets() {
        let mut s = stream(1000, 64);
        let mut out = Vec::new();
        let mut buf = [0u8; 100];
        loop {
            let n = s.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, expected(0..1000));
        assert_eq!(s.pos(), 1000);
        assert_eq!(s.remaining(), 0);

        // every packet was retired and the reader closed at end of block
        let stats = s.source().allocator.stats();
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(*s.source().readers_closed.lock(), 1);
    }

    #[test]
    fn test_io_read_to_end() {
        use std::io::Read;
        let mut s = stream(300, 7);
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, expected(0..300));
    }

    #[test]
    fn test_seek_discards_current_packet() {
        let mut s = stream(1000, 128);
        let mut buf = [0u8; 10];
        s.read(&mut buf).unwrap();
        assert_eq!(s.source().allocator.stats().outstanding(), 1);

        s.seek(500).unwrap();
        assert_eq!(s.source().allocator.stats().outstanding(), 0);
        assert_eq!(s.read(&mut buf).unwrap(), 10);
        assert_eq!(buf.to_vec(), expected(500..510));
    }

    #[test]
    fn test_seek_bounds() {
        let mut s = stream(100, 10);
        s.seek(100).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 0);
        assert!(matches!(s.seek(101), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn test_io_seek() {
        use std::io::{Read, Seek};
        let mut s = stream(100, 10);
        assert_eq!(Seek::seek(&mut s, SeekFrom::End(-10)).unwrap(), 90);
        assert_eq!(Seek::seek(&mut s, SeekFrom::Current(-5)).unwrap(), 85);
        let mut buf = [0u8; 5];
        Read::read_exact(&mut s, &mut buf).unwrap();
        assert_eq!(buf.to_vec(), expected(85..90));
        assert!(Seek::seek(&mut s, SeekFrom::Current(-1000)).is_err());
    }

    #[test]
    fn test_skip() {
        let mut s = stream(100, 10);
        assert_eq!(s.skip(30).unwrap(), 30);
        assert_eq!(s.skip(1000).unwrap(), 70);
        assert_eq!(s.skip(1).unwrap(), 0);
        assert_eq!(s.pos(), 100);
    }

    #[test]
    fn test_positioned_read_keeps_position() {
        let mut s = stream(1000, 64);
        let mut buf = [0u8; 10];
        s.read(&mut buf).unwrap();

        let mut range = [0u8; 200];
        assert_eq!(s.positioned_read(700, &mut range).unwrap(), 200);
        assert_eq!(range.to_vec(), expected(700..900));

        // clamped at the end of the block
        assert_eq!(s.positioned_read(950, &mut range).unwrap(), 50);
        assert_eq!(s.positioned_read(1000, &mut range).unwrap(), 0);

        assert_eq!(s.pos(), 10);
        s.read(&mut buf).unwrap();
        assert_eq!(buf.to_vec(), expected(10..20));
    }

    #[test]
    fn test_truncated_source_is_an_error() {
        let mut s = stream(100, 10);
        s.source.truncate_at = Some(50);

        let mut buf = [0u8; 100];
        let mut total = 0;
        let err = loop {
            match s.read(&mut buf) {
                Ok(n) => total += n,
                Err(e) => break e,
            }
        };
        assert_eq!(total, 50);
        assert!(matches!(err, Error::UnexpectedEof { offset: 50, expected: 50, .. }));

        let err = s.positioned_read(40, &mut buf).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { offset: 50, .. }));
        assert_eq!(s.source().allocator.stats().outstanding(), 0);
    }

    #[test]
    fn test_empty_packets_are_an_error() {
        let mut s = stream(64, 0);
        let mut buf = [0u8; 8];

        let err = s.read(&mut buf).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { offset: 0, expected: 64, .. }));
        assert_eq!(s.pos(), 0);

        let err = s.positioned_read(10, &mut buf).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { offset: 10, expected: 8, .. }));

        assert_eq!(s.source().allocator.stats().outstanding(), 0);
        assert_eq!(*s.source().destroyed.lock(), 2);
    }

    #[test]
    fn test_closed_stream_rejects_reads() {
        let mut s = stream(100, 10);
        let mut buf = [0u8; 10];
        s.read(&mut buf).unwrap();
        s.close();
        s.close();

        assert!(s.is_closed());
        assert!(matches!(s.read(&mut buf), Err(Error::StreamClosed)));
        assert!(matches!(s.seek(0), Err(Error::StreamClosed)));
        assert!(matches!(s.positioned_read(0, &mut buf), Err(Error::StreamClosed)));
        assert_eq!(s.source().allocator.stats().outstanding(), 0);
        assert_eq!(*s.source().destroyed.lock(), 1);
    }
}
