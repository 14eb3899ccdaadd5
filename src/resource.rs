use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::file_store::FileChunkStore;
use crate::http_utils::{self, HttpError};
use crate::shared_types::{ByteCount, ChunkIndex, ChunkRange};
use crate::store::{ChunkStore, ChunkStoreError};

#[derive(Error, Debug)]
pub enum HttpStoreError {
    #[error("Resource read error: {0}")]
    ReadError(#[from] HttpError),
    #[error("{0} does not support partial content")]
    NoPartialContentSupport(Url),
    #[error("Chunk {0} is past the end of the resource")]
    OutOfRange(ChunkIndex),
}

/// Where the bytes come from, as given on the command line.
#[derive(Debug, Clone)]
pub enum ChunkSource {
    File(PathBuf),
    Http(Url),
}

impl ChunkSource {
    pub fn parse(source: &str) -> Result<Self, Box<dyn Error>> {
        match Url::parse(source) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(ChunkSource::Http(url)),
                "file" => url
                    .to_file_path()
                    .map(ChunkSource::File)
                    .map_err(|_| format!("Not a local file url: {url}").into()),
                _ => Err(format!("Unsupported scheme: {}", url.scheme()).into()),
            },
            Err(_) => Ok(ChunkSource::File(PathBuf::from(source))),
        }
    }

    pub async fn open(
        &self,
        chunk_length: ByteCount,
    ) -> Result<Arc<dyn ChunkStore>, Box<dyn Error>> {
        let store: Arc<dyn ChunkStore> = match self {
            ChunkSource::File(path) => Arc::new(FileChunkStore::open(path, chunk_length).await?),
            ChunkSource::Http(url) => Arc::new(HttpChunkStore::connect(url, chunk_length).await?),
        };
        Ok(store)
    }
}

/// Read-only view of a remote resource as chunks, one range request per chunk.
pub struct HttpChunkStore {
    client: reqwest::Client,
    url: Url,
    chunk_length: ByteCount,
    length: Option<ByteCount>,
}

impl HttpChunkStore {
    pub async fn connect(url: &Url, chunk_length: ByteCount) -> Result<Self, HttpStoreError> {
        let (url, headers) = http_utils::probe(url).await?;
        debug!("headers: {:?}", headers);
        if !http_utils::supports_byte_ranges(&headers) {
            return Err(HttpStoreError::NoPartialContentSupport(url));
        }
        let length = http_utils::content_length(&headers);
        debug!("{url} has length {length:?}");

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            chunk_length,
            length,
        })
    }

    /// Byte range covered by chunk `index`, clamped to the known length.
    fn chunk_range(&self, index: ChunkIndex) -> Result<ChunkRange, HttpStoreError> {
        let start = index
            .checked_mul(self.chunk_length)
            .ok_or(HttpStoreError::OutOfRange(index))?;
        let mut end = start
            .checked_add(self.chunk_length.saturating_sub(1))
            .ok_or(HttpStoreError::OutOfRange(index))?;
        if let Some(length) = self.length {
            if start >= length {
                return Err(HttpStoreError::OutOfRange(index));
            }
            end = end.min(length - 1);
        }
        Ok(ChunkRange { start, end })
    }
}

#[async_trait]
impl ChunkStore for HttpChunkStore {
    fn chunk_length(&self) -> ByteCount {
        self.chunk_length
    }

    fn length(&self) -> Option<ByteCount> {
        self.length
    }

    async fn get(&self, index: ChunkIndex) -> Result<Bytes, ChunkStoreError> {
        let range = self.chunk_range(index)?;
        let chunk = http_utils::get_range(&self.client, &self.url, range)
            .await
            .map_err(HttpStoreError::from)?;
        debug!("chunk {index}: {} bytes", chunk.len());
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(length: Option<ByteCount>) -> HttpChunkStore {
        HttpChunkStore {
            client: reqwest::Client::new(),
            url: Url::parse("http://localhost/blob").unwrap(),
            chunk_length: 4,
            length,
        }
    }

    #[test]
    fn test_chunk_range_clamps_to_length() {
        let store = store(Some(10));
        assert_eq!(store.chunk_range(0).unwrap(), ChunkRange { start: 0, end: 3 });
        assert_eq!(store.chunk_range(2).unwrap(), ChunkRange { start: 8, end: 9 });
        assert!(matches!(
            store.chunk_range(3),
            Err(HttpStoreError::OutOfRange(3))
        ));
    }

    #[test]
    fn test_chunk_range_without_length() {
        let store = store(None);
        assert_eq!(
            store.chunk_range(5).unwrap(),
            ChunkRange { start: 20, end: 23 }
        );
    }

    #[test]
    fn test_chunk_range_overflow_is_out_of_range() {
        let store = store(None);
        let index = u64::MAX / 2;
        assert!(matches!(
            store.chunk_range(index),
            Err(HttpStoreError::OutOfRange(i)) if i == index
        ));
        assert_eq!(
            store.chunk_range(u64::MAX / 4).unwrap(),
            ChunkRange {
                start: u64::MAX - 3,
                end: u64::MAX
            }
        );
    }

    #[test]
    fn test_parse_source() {
        assert!(matches!(
            ChunkSource::parse("https://example.com/a.bin").unwrap(),
            ChunkSource::Http(_)
        ));
        assert!(matches!(
            ChunkSource::parse("./data/a.bin").unwrap(),
            ChunkSource::File(_)
        ));
        assert!(ChunkSource::parse("ftp://example.com/a.bin").is_err());
    }
}
