//! Drains a range stream into any async writer.

use async_stream::try_stream;
use bytes::Bytes;
use futures::{pin_mut, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::RangeStreamError;
use crate::shared_types::ByteCount;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Range stream error: {0}")]
    Stream(#[from] RangeStreamError),
    #[error("Write error: {0}")]
    Write(#[from] std::io::Error),
}

/// Passes chunks through unchanged, reporting each chunk's size on `s_progress`.
pub fn report_progress<S>(
    stream: S,
    s_progress: mpsc::Sender<ByteCount>,
) -> impl Stream<Item = Result<Bytes, RangeStreamError>>
where
    S: Stream<Item = Result<Bytes, RangeStreamError>>,
{
    try_stream! {
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            // A dropped receiver only means nobody is watching.
            s_progress.send(chunk.len() as ByteCount).await.ok();
            yield chunk;
        }
    }
}

/// Writes every chunk of `stream` to `output` and returns the byte count.
pub async fn copy_range<S, W>(stream: S, output: &mut W) -> Result<ByteCount, PipeError>
where
    S: Stream<Item = Result<Bytes, RangeStreamError>>,
    W: AsyncWrite + Unpin,
{
    pin_mut!(stream);
    let mut written = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        output.write_all(&chunk).await?;
        written += chunk.len() as ByteCount;
    }
    output.flush().await?;
    debug!("copied {written} bytes");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryChunkStore;
    use crate::range_stream::{RangeOptions, RangeStream};

    #[tokio::test]
    async fn test_copy_range_with_progress() {
        let store = Arc::new(
            MemoryChunkStore::from_bytes(b"0123456789", 4, None)
                .await
                .unwrap(),
        );
        let stream = RangeStream::new(store, RangeOptions::new().start(3).end(8)).unwrap();
        let (s_progress, mut r_progress) = mpsc::channel(8);

        let mut output = Vec::new();
        let written = copy_range(report_progress(stream, s_progress), &mut output)
            .await
            .unwrap();

        assert_eq!(written, 6);
        assert_eq!(output, b"345678");
        let mut reported = Vec::new();
        while let Some(n) = r_progress.recv().await {
            reported.push(n);
        }
        assert_eq!(reported, vec![1, 4, 1]);
    }

    #[tokio::test]
    async fn test_copy_range_surfaces_stream_error() {
        let store = Arc::new(
            MemoryChunkStore::from_bytes(b"abc", 3, Some(9))
                .await
                .unwrap(),
        );
        let stream = RangeStream::new(store, RangeOptions::new()).unwrap();
        let mut output = Vec::new();
        let res = copy_range(stream, &mut output).await;
        assert!(matches!(
            res,
            Err(PipeError::Stream(RangeStreamError::Fetch { index: 1, .. }))
        ));
        assert_eq!(output, b"abc");
    }

    #[tokio::test]
    async fn test_progress_adds_up_through_small_channel() {
        let store = Arc::new(
            MemoryChunkStore::from_bytes(b"0123456789ab", 2, None)
                .await
                .unwrap(),
        );
        let stream = RangeStream::new(store, RangeOptions::new()).unwrap();
        let (s_progress, mut r_progress) = mpsc::channel(1);
        let counter = tokio::spawn(async move {
            let mut reported: ByteCount = 0;
            while let Some(n) = r_progress.recv().await {
                reported += n;
            }
            reported
        });

        let mut output = Vec::new();
        let written = copy_range(report_progress(stream, s_progress), &mut output)
            .await
            .unwrap();

        assert_eq!(written, 12);
        assert_eq!(counter.await.unwrap(), written);
    }
}
