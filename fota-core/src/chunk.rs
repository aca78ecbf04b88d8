//! Chunks: an artifact is served as fixed `REQUEST_PACKET_SIZE` slices, reassembled in order.

use std::io::{self, Read, Seek, SeekFrom};

use crate::protocol::REQUEST_PACKET_SIZE;

/// Number of chunks for an artifact of `len` bytes: `ceil(len / REQUEST_PACKET_SIZE)`.
pub fn chunk_count(len: u64) -> Result<u16, ChunkError> {
    let count = len.div_ceil(REQUEST_PACKET_SIZE as u64);
    u16::try_from(count).map_err(|_| ChunkError::TooManyChunks(len))
}

/// Byte offset of a chunk within its artifact.
pub fn chunk_offset(chunk_id: u16) -> u64 {
    u64::from(chunk_id) * REQUEST_PACKET_SIZE as u64
}

/// Read up to `REQUEST_PACKET_SIZE` bytes of chunk `chunk_id`. Short only at end of file.
pub fn read_chunk<R: Read + Seek>(source: &mut R, chunk_id: u16) -> io::Result<Vec<u8>> {
    source.seek(SeekFrom::Start(chunk_offset(chunk_id)))?;
    let mut buf = vec![0u8; REQUEST_PACKET_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("artifact of {0} bytes needs more than 65535 chunks")]
    TooManyChunks(u64),
}

/// Result of offering a received chunk to the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Last chunk stored; the reassembled artifact is ready.
    Complete(Vec<u8>),
    /// Chunk stored; more to come.
    InProgress,
    /// Not the chunk we asked for, or a wrong size. Nothing stored.
    Ignored,
}

/// Client-side reassembly. Chunks are requested one at a time, so only the next
/// expected chunk is accepted.
pub struct ChunkAssembler {
    nr_chunks: u16,
    next: u16,
    image: Vec<u8>,
}

impl ChunkAssembler {
    pub fn new(nr_chunks: u16) -> Self {
        Self {
            nr_chunks,
            next: 0,
            image: Vec::with_capacity(usize::from(nr_chunks) * REQUEST_PACKET_SIZE),
        }
    }

    /// Next chunk to request, or `None` once complete.
    pub fn next_chunk(&self) -> Option<u16> {
        (self.next < self.nr_chunks).then_some(self.next)
    }

    pub fn nr_chunks(&self) -> u16 {
        self.nr_chunks
    }

    pub fn received(&self) -> u16 {
        self.next
    }

    pub fn is_complete(&self) -> bool {
        self.next == self.nr_chunks
    }

    pub fn accept(&mut self, chunk_id: u16, data: &[u8]) -> ChunkReceiveResult {
        if self.is_complete() || chunk_id != self.next {
            return ChunkReceiveResult::Ignored;
        }
        let last = chunk_id + 1 == self.nr_chunks;
        let size_ok = if last {
            !data.is_empty() && data.len() <= REQUEST_PACKET_SIZE
        } else {
            data.len() == REQUEST_PACKET_SIZE
        };
        if !size_ok {
            return ChunkReceiveResult::Ignored;
        }
        self.image.extend_from_slice(data);
        self.next += 1;
        if last {
            ChunkReceiveResult::Complete(std::mem::take(&mut self.image))
        } else {
            ChunkReceiveResult::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn count_rounds_up() {
        assert_eq!(chunk_count(0).unwrap(), 0);
        assert_eq!(chunk_count(1).unwrap(), 1);
        assert_eq!(chunk_count(58).unwrap(), 1);
        assert_eq!(chunk_count(59).unwrap(), 2);
        assert_eq!(chunk_count(58 * 100).unwrap(), 100);
    }

    #[test]
    fn count_rejects_huge_artifacts() {
        let too_big = 58 * 65_536;
        assert!(matches!(
            chunk_count(too_big),
            Err(ChunkError::TooManyChunks(_))
        ));
        assert_eq!(chunk_count(58 * 65_535).unwrap(), u16::MAX);
    }

    #[test]
    fn read_chunk_slices_file() {
        let data: Vec<u8> = (0..150u32).map(|i| i as u8).collect();
        let mut src = Cursor::new(data.clone());
        assert_eq!(read_chunk(&mut src, 0).unwrap(), &data[0..58]);
        assert_eq!(read_chunk(&mut src, 2).unwrap(), &data[116..150]);
        assert_eq!(read_chunk(&mut src, 1).unwrap(), &data[58..116]);
        assert!(read_chunk(&mut src, 3).unwrap().is_empty());
    }

    #[test]
    fn assembler_reassembles_in_order() {
        let data: Vec<u8> = (0..130u32).map(|i| (i * 3) as u8).collect();
        let mut asm = ChunkAssembler::new(chunk_count(data.len() as u64).unwrap());
        let mut result = None;
        for (i, piece) in data.chunks(REQUEST_PACKET_SIZE).enumerate() {
            assert_eq!(asm.next_chunk(), Some(i as u16));
            match asm.accept(i as u16, piece) {
                ChunkReceiveResult::InProgress => {}
                ChunkReceiveResult::Complete(bytes) => result = Some(bytes),
                ChunkReceiveResult::Ignored => panic!("chunk {i} ignored"),
            }
        }
        assert_eq!(result.unwrap(), data);
        assert!(asm.is_complete());
        assert_eq!(asm.next_chunk(), None);
    }

    #[test]
    fn assembler_ignores_out_of_order_and_bad_sizes() {
        let mut asm = ChunkAssembler::new(2);
        assert_eq!(asm.accept(1, &[0; 10]), ChunkReceiveResult::Ignored);
        assert_eq!(asm.accept(0, &[0; 10]), ChunkReceiveResult::Ignored);
        assert_eq!(
            asm.accept(0, &[0; REQUEST_PACKET_SIZE]),
            ChunkReceiveResult::InProgress
        );
        // duplicate of a stored chunk
        assert_eq!(
            asm.accept(0, &[0; REQUEST_PACKET_SIZE]),
            ChunkReceiveResult::Ignored
        );
        assert_eq!(asm.accept(1, &[]), ChunkReceiveResult::Ignored);
        assert!(matches!(
            asm.accept(1, &[9; 5]),
            ChunkReceiveResult::Complete(bytes) if bytes.len() == REQUEST_PACKET_SIZE + 5
        ));
    }
}
