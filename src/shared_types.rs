/// Inclusive byte range, `start..=end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn byte_count(&self) -> ByteCount {
        self.end - self.start + 1
    }
}

pub type ByteCount = u64;
pub type ChunkIndex = u64;
