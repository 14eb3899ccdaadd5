//! Sequential byte stream over a sub-range of a chunk store.
//!
//! The consumer drives everything: each `poll_next` is a request for more
//! bytes, and at most one chunk fetch is outstanding at a time. Polls that
//! arrive while a fetch is in flight just poll that same fetch again.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use futures::{FutureExt, Stream};
use tokio::sync::watch;

use crate::error::{RangeStreamError, Result};
use crate::miss::{self, MissHandler, Retry};
use crate::shared_types::{ByteCount, ChunkIndex, ChunkRange};
use crate::store::{ChunkStore, ChunkStoreError};

#[derive(Default, Clone)]
pub struct RangeOptions {
    start: Option<ByteCount>,
    end: Option<ByteCount>,
    on_miss: Option<Arc<MissHandler>>,
    miss_timeout: Option<Duration>,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// First byte to deliver. Defaults to 0.
    pub fn start(mut self, start: ByteCount) -> Self {
        self.start = Some(start);
        self
    }

    /// Last byte to deliver, inclusive. Defaults to the last byte of the store.
    pub fn end(mut self, end: ByteCount) -> Self {
        self.end = Some(end);
        self
    }

    pub fn on_miss<F>(mut self, handler: F) -> Self
    where
        F: Fn(ChunkStoreError, ChunkIndex, Retry) + Send + Sync + 'static,
    {
        self.on_miss = Some(Arc::new(handler));
        self
    }

    /// Give up on a miss when the handler has not used its retry handle in
    /// time. Without it an unanswered miss stalls the stream.
    pub fn miss_timeout(mut self, timeout: Duration) -> Self {
        self.miss_timeout = Some(timeout);
        self
    }
}

/// How a stream ended, as seen by `closed()` observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Every byte of the range was delivered.
    Ended,
    /// Torn down explicitly before the range was exhausted.
    Destroyed,
    /// A fetch failed; carries the error message the consumer received.
    Failed(Arc<str>),
}

/// Teardown state shared between the stream and its [`DestroyHandle`]s.
struct Teardown {
    destroyed: AtomicBool,
    store: Mutex<Option<Arc<dyn ChunkStore>>>,
    waker: AtomicWaker,
    s_closed: watch::Sender<Option<CloseReason>>,
}

impl Teardown {
    fn new(store: Arc<dyn ChunkStore>) -> Self {
        let (s_closed, _) = watch::channel(None);
        Self {
            destroyed: AtomicBool::new(false),
            store: Mutex::new(Some(store)),
            waker: AtomicWaker::new(),
            s_closed,
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn store(&self) -> Option<Arc<dyn ChunkStore>> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Marks the stream destroyed and lets go of the store, without telling
    /// `closed` observers yet. Returns false when already destroyed.
    fn begin_destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(store);
        true
    }

    fn signal_closed(&self, reason: CloseReason) {
        debug!("range stream closed: {reason:?}");
        self.s_closed.send_replace(Some(reason));
        self.waker.wake();
    }

    fn destroy(&self, reason: CloseReason) -> bool {
        if !self.begin_destroy() {
            return false;
        }
        self.signal_closed(reason);
        true
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.s_closed.borrow().clone()
    }

    async fn closed(&self) -> CloseReason {
        let mut r_closed = self.s_closed.subscribe();
        loop {
            let reason = r_closed.borrow_and_update().clone();
            if let Some(reason) = reason {
                return reason;
            }
            // The sender lives in `self`, so this only fails once we're gone.
            if r_closed.changed().await.is_err() {
                return CloseReason::Destroyed;
            }
        }
    }
}

/// Tears a [`RangeStream`] down from outside, e.g. from inside a miss handler.
#[derive(Clone)]
pub struct DestroyHandle {
    teardown: Arc<Teardown>,
}

impl DestroyHandle {
    /// Releases the store right away; a fetch already in flight is dropped
    /// the next time the stream is polled.
    pub fn destroy(&self) -> bool {
        self.teardown.destroy(CloseReason::Destroyed)
    }

    pub fn is_destroyed(&self) -> bool {
        self.teardown.is_destroyed()
    }

    /// `None` until the close has been signalled.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.teardown.close_reason()
    }

    pub async fn closed(&self) -> CloseReason {
        self.teardown.closed().await
    }
}

pub struct RangeStream {
    on_miss: Option<Arc<MissHandler>>,
    miss_timeout: Option<Duration>,
    range: ChunkRange,
    current_index: ChunkIndex,
    bytes_offset: ByteCount,
    bytes_left: ByteCount,
    reading: Option<BoxFuture<'static, Result<Bytes>>>,
    teardown: Arc<Teardown>,
    /// Close signal held back until the consumer has had the error.
    pending_close: Option<CloseReason>,
}

impl RangeStream {
    pub fn new(store: Arc<dyn ChunkStore>, options: RangeOptions) -> Result<Self> {
        let chunk_length = store.chunk_length();
        if chunk_length == 0 {
            return Err(RangeStreamError::config("chunk store reports a zero chunk length"));
        }

        let start = options.start.unwrap_or(0);
        let end = match (options.end, store.length()) {
            (Some(end), _) => end,
            (None, Some(0)) => {
                return Err(RangeStreamError::config(
                    "chunk store is empty, there is no default end",
                ))
            }
            (None, Some(length)) => length - 1,
            (None, None) => {
                return Err(RangeStreamError::config(
                    "must define an end or use a chunk store with a length",
                ))
            }
        };
        if end < start {
            return Err(RangeStreamError::config(format!(
                "start ({start}) must be less than or equal to the end ({end})"
            )));
        }
        let bytes_left = (end - start)
            .checked_add(1)
            .ok_or_else(|| RangeStreamError::config("range length overflows"))?;

        let current_index = start / chunk_length;
        debug!("streaming bytes {start}..={end} starting at chunk {current_index}");

        Ok(Self {
            on_miss: options.on_miss,
            miss_timeout: options.miss_timeout,
            range: ChunkRange { start, end },
            current_index,
            bytes_offset: start - current_index * chunk_length,
            bytes_left,
            reading: None,
            teardown: Arc::new(Teardown::new(store)),
            pending_close: None,
        })
    }

    /// The inclusive byte range this stream delivers.
    pub fn range(&self) -> ChunkRange {
        self.range
    }

    pub fn bytes_left(&self) -> ByteCount {
        self.bytes_left
    }

    pub fn is_reading(&self) -> bool {
        self.reading.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.teardown.is_destroyed()
    }

    pub fn destroy_handle(&self) -> DestroyHandle {
        DestroyHandle {
            teardown: self.teardown.clone(),
        }
    }

    /// Resolves once the stream has been torn down, for whatever reason.
    ///
    /// After a failed fetch this resolves only once the consumer has been
    /// handed the error (on the next poll, or when the stream is dropped).
    pub fn closed(&self) -> impl Future<Output = CloseReason> + Send + 'static {
        let teardown = self.teardown.clone();
        async move { teardown.closed().await }
    }

    /// Explicit teardown. Safe to call repeatedly and before any read.
    pub fn destroy(&mut self) -> bool {
        self.flush_close();
        self.reading = None;
        self.teardown.destroy(CloseReason::Destroyed)
    }

    fn fail(&mut self, err: &RangeStreamError) {
        self.reading = None;
        if self.teardown.begin_destroy() {
            error!("range stream failed: {err}");
            self.pending_close = Some(CloseReason::Failed(err.to_string().into()));
        }
    }

    fn flush_close(&mut self) {
        if let Some(reason) = self.pending_close.take() {
            self.teardown.signal_closed(reason);
        }
    }

    fn start_fetch(&mut self) -> Option<BoxFuture<'static, Result<Bytes>>> {
        let store = self.teardown.store()?;
        debug!("fetching chunk {}", self.current_index);
        Some(
            miss::fetch_guarded(
                store,
                self.current_index,
                self.on_miss.clone(),
                self.miss_timeout,
            )
            .boxed(),
        )
    }

    /// Trims a fetched chunk to the range and advances to the next chunk.
    fn take_chunk(&mut self, mut chunk: Bytes) -> Result<Bytes> {
        if self.bytes_offset != 0 {
            let offset = self.bytes_offset.min(chunk.len() as ByteCount) as usize;
            chunk = chunk.slice(offset..);
            self.bytes_offset = 0;
        }
        if self.bytes_left < chunk.len() as ByteCount {
            chunk.truncate(self.bytes_left as usize);
        }
        if chunk.is_empty() {
            return Err(RangeStreamError::ShortChunk {
                index: self.current_index,
            });
        }

        self.bytes_left -= chunk.len() as ByteCount;
        self.current_index += 1;
        Ok(chunk)
    }
}

impl Drop for RangeStream {
    fn drop(&mut self) {
        self.flush_close();
    }
}

impl Stream for RangeStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.teardown.waker.register(cx.waker());

        if this.teardown.is_destroyed() {
            this.reading = None;
            this.flush_close();
            return Poll::Ready(None);
        }

        if this.reading.is_none() {
            if this.bytes_left == 0 {
                debug!("range exhausted");
                this.teardown.destroy(CloseReason::Ended);
                return Poll::Ready(None);
            }
            this.reading = this.start_fetch();
        }
        let Some(fetch) = this.reading.as_mut() else {
            return Poll::Ready(None);
        };
        let res = ready!(fetch.poll_unpin(cx));
        this.reading = None;

        // Torn down while the fetch was outstanding: drop its outcome.
        if this.teardown.is_destroyed() {
            return Poll::Ready(None);
        }

        match res.and_then(|chunk| this.take_chunk(chunk)) {
            Ok(chunk) => Poll::Ready(Some(Ok(chunk))),
            Err(err) => {
                this.fail(&err);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}
