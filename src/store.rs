use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;

use crate::shared_types::{ByteCount, ChunkIndex};

/// Opaque failure reported by a chunk store. The range stream never looks
/// inside it; it only hands it to the miss handler or wraps it.
pub type ChunkStoreError = Box<dyn Error + Send + Sync>;

/// Read side of a fixed-size chunk store.
///
/// Every chunk is `chunk_length()` bytes long except possibly the last one.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    fn chunk_length(&self) -> ByteCount;

    /// Total logical length of the content, when the store knows it.
    fn length(&self) -> Option<ByteCount>;

    async fn get(&self, index: ChunkIndex) -> Result<Bytes, ChunkStoreError>;
}
