// src/planner.rs

/// Fixed chunk size: 4 MiB.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Files strictly larger than this are split into more than one chunk.
pub const CHUNKING_THRESHOLD: u64 = CHUNK_SIZE;

/// Byte range `[offset, offset + length)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_chunks: u32,
    pub ranges: Vec<ChunkRange>,
}

/// A chunk size of 0 means [`CHUNK_SIZE`].
pub fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// `ceil(size / chunk_size)`.
pub fn total_chunks(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(effective_chunk_size(chunk_size)) as u32
}

/// Splits `size` bytes into contiguous chunks. Only the last one may be short.
pub fn plan(size: u64, chunk_size: u64) -> ChunkPlan {
    let chunk_size = effective_chunk_size(chunk_size);
    let total = total_chunks(size, chunk_size);
    let ranges = (0..total)
        .map(|index| {
            let offset = index as u64 * chunk_size;
            let end = (offset + chunk_size).min(size);
            ChunkRange {
                index,
                offset,
                length: end - offset,
            }
        })
        .collect();

    ChunkPlan {
        total_chunks: total,
        ranges,
    }
}

pub fn needs_chunking(size: u64, threshold: u64) -> bool {
    size > threshold
}
