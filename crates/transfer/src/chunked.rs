use sha2::{Digest, Sha256};

use crate::DEFAULT_CHUNK_SIZE;

/// A contiguous byte range of a file sent as one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Byte offset within the file.
    pub offset: u64,
    /// Length of the range in bytes.
    pub len: usize,
}

impl ChunkRange {
    /// Offset one past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// Splits `[start, size)` into ranges of at most `chunk_size` bytes.
///
/// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used. Returns an empty
/// plan when nothing remains.
pub fn plan_chunks(start: u64, size: u64, chunk_size: usize) -> Vec<ChunkRange> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let mut ranges = Vec::new();
    let mut offset = start;
    while offset < size {
        let len = std::cmp::min(size - offset, chunk_size as u64) as usize;
        ranges.push(ChunkRange { offset, len });
        offset += len as u64;
    }
    ranges
}

/// Byte range of the file carried by one remote upload.
///
/// A file is sent either as one upload covering everything or, when chunks
/// go out in parallel, as several partial uploads that the server
/// concatenates once all of them are complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// Byte offset of the part within the file.
    pub offset: u64,
    pub len: u64,
}

impl PartRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Splits a file of `size` bytes into at most `max_parts` ranges that
/// start on chunk boundaries.
///
/// Returns a single range covering the whole file (possibly empty) when
/// the file fits in one chunk or `max_parts` is 1.
pub fn plan_parts(size: u64, chunk_size: usize, max_parts: usize) -> Vec<PartRange> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    } as u64;
    let chunks = size.div_ceil(chunk_size);
    if max_parts <= 1 || chunks <= 1 {
        return vec![PartRange {
            offset: 0,
            len: size,
        }];
    }

    let step = chunks
        .div_ceil(max_parts as u64)
        .saturating_mul(chunk_size);
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = std::cmp::min(size - offset, step);
        parts.push(PartRange { offset, len });
        offset += len;
    }
    parts
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
