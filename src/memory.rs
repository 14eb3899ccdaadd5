//! In-memory chunk store, mostly for tests and demos.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::shared_types::{ByteCount, ChunkIndex};
use crate::store::{ChunkStore, ChunkStoreError};

#[derive(Error, Debug)]
pub enum MemoryStoreError {
    #[error("Chunk {0} is not present in the store")]
    Missing(ChunkIndex),
    #[error("Chunk length must be greater than zero")]
    ZeroChunkLength,
    #[error("Chunk {index} is {actual} bytes, store chunks are {expected} bytes")]
    BadChunkLength {
        index: ChunkIndex,
        expected: ByteCount,
        actual: ByteCount,
    },
}

pub struct MemoryChunkStore {
    chunk_length: ByteCount,
    length: Option<ByteCount>,
    chunks: RwLock<HashMap<ChunkIndex, Bytes>>,
}

impl MemoryChunkStore {
    pub fn new(chunk_length: ByteCount, length: Option<ByteCount>) -> Self {
        Self {
            chunk_length,
            length,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Splits `data` into chunks and stores all of them. The declared length
    /// defaults to `data.len()` but may be larger, leaving trailing chunks
    /// missing.
    pub async fn from_bytes(
        data: &[u8],
        chunk_length: ByteCount,
        length: Option<ByteCount>,
    ) -> Result<Self, MemoryStoreError> {
        if chunk_length == 0 {
            return Err(MemoryStoreError::ZeroChunkLength);
        }
        let store = Self::new(chunk_length, length.or(Some(data.len() as ByteCount)));
        for (index, chunk) in data.chunks(chunk_length as usize).enumerate() {
            store
                .put(index as ChunkIndex, Bytes::copy_from_slice(chunk))
                .await?;
        }
        Ok(store)
    }

    /// Only the last chunk of the declared length may be shorter than
    /// `chunk_length`; when the length is unknown any chunk may be short.
    pub async fn put(&self, index: ChunkIndex, chunk: Bytes) -> Result<(), MemoryStoreError> {
        let actual = chunk.len() as ByteCount;
        // A chunk whose end can't even be computed is past any length.
        let is_last = match self.length {
            Some(len) => index
                .checked_add(1)
                .and_then(|next| next.checked_mul(self.chunk_length))
                .map_or(true, |chunk_end| chunk_end >= len),
            None => true,
        };
        if actual > self.chunk_length || (actual < self.chunk_length && !is_last) {
            return Err(MemoryStoreError::BadChunkLength {
                index,
                expected: self.chunk_length,
                actual,
            });
        }
        self.chunks.write().await.insert(index, chunk);
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    fn chunk_length(&self) -> ByteCount {
        self.chunk_length
    }

    fn length(&self) -> Option<ByteCount> {
        self.length
    }

    async fn get(&self, index: ChunkIndex) -> Result<Bytes, ChunkStoreError> {
        self.chunks
            .read()
            .await
            .get(&index)
            .cloned()
            .ok_or_else(|| MemoryStoreError::Missing(index).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_bytes_splits_uneven_tail() {
        let store = MemoryChunkStore::from_bytes(b"abcd", 3, None).await.unwrap();
        assert_eq!(store.length(), Some(4));
        assert_eq!(store.get(0).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(store.get(1).await.unwrap(), Bytes::from_static(b"d"));
        assert!(store.get(2).await.is_err());
    }

    #[tokio::test]
    async fn test_put_rejects_short_inner_chunk() {
        let store = MemoryChunkStore::new(3, Some(9));
        let res = store.put(0, Bytes::from_static(b"ab")).await;
        assert!(matches!(
            res,
            Err(MemoryStoreError::BadChunkLength { index: 0, .. })
        ));
        store.put(2, Bytes::from_static(b"ab")).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_with_huge_index_counts_as_last() {
        let store = MemoryChunkStore::new(3, Some(9));
        store
            .put(u64::MAX / 2, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        assert!(store.put(u64::MAX / 2, Bytes::from_static(b"abcd")).await.is_err());
    }
}
