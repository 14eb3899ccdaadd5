use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::shared_types::{ByteCount, ChunkIndex};
use crate::store::{ChunkStore, ChunkStoreError};

/// Read-only view of a local file as fixed-size chunks.
pub struct FileChunkStore {
    path: PathBuf,
    chunk_length: ByteCount,
    length: ByteCount,
}

impl FileChunkStore {
    pub async fn open(path: impl AsRef<Path>, chunk_length: ByteCount) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        let length = tokio::fs::metadata(&path).await?.len();
        debug!("{} is {length} bytes", path.display());
        Ok(Self {
            path,
            chunk_length,
            length,
        })
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    fn chunk_length(&self) -> ByteCount {
        self.chunk_length
    }

    fn length(&self) -> Option<ByteCount> {
        Some(self.length)
    }

    async fn get(&self, index: ChunkIndex) -> Result<Bytes, ChunkStoreError> {
        let offset = index * self.chunk_length;
        if offset >= self.length {
            return Err(format!("chunk {index} is past the end of {}", self.path.display()).into());
        }

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut chunk = Vec::with_capacity(self.chunk_length.min(self.length - offset) as usize);
        file.take(self.chunk_length).read_to_end(&mut chunk).await?;
        Ok(chunk.into())
    }
}
