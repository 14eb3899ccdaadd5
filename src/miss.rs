//! Miss protocol: a failed chunk fetch is handed to the caller's miss handler
//! together with a [`Retry`] handle, which may re-fetch the chunk exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{RangeStreamError, Result};
use crate::shared_types::ChunkIndex;
use crate::store::{ChunkStore, ChunkStoreError};

/// Called with the fetch error, the chunk index and the retry handle.
pub type MissHandler = dyn Fn(ChunkStoreError, ChunkIndex, Retry) + Send + Sync;

enum RetryDecision {
    Refetch,
    Fail(ChunkStoreError),
}

struct RetryState {
    index: ChunkIndex,
    retry_consumed: AtomicBool,
    s_decision: mpsc::UnboundedSender<RetryDecision>,
}

/// One-shot permission to re-fetch a missed chunk.
///
/// Clones share the same state: only the first `retry` or `fail` across all
/// clones is honoured, every later call returns [`RangeStreamError::Protocol`].
#[derive(Clone)]
pub struct Retry {
    state: Arc<RetryState>,
}

impl Retry {
    fn new(index: ChunkIndex) -> (Self, mpsc::UnboundedReceiver<RetryDecision>) {
        let (s_decision, r_decision) = mpsc::unbounded_channel();
        let state = RetryState {
            index,
            retry_consumed: AtomicBool::new(false),
            s_decision,
        };
        (
            Self {
                state: Arc::new(state),
            },
            r_decision,
        )
    }

    pub fn index(&self) -> ChunkIndex {
        self.state.index
    }

    pub fn is_consumed(&self) -> bool {
        self.state.retry_consumed.load(Ordering::Acquire)
    }

    /// Fetch the chunk once more; that outcome is final.
    pub fn retry(&self) -> Result<()> {
        self.decide(RetryDecision::Refetch)
    }

    /// Give up on the chunk, terminating the stream with `err`.
    pub fn fail(&self, err: impl Into<ChunkStoreError>) -> Result<()> {
        self.decide(RetryDecision::Fail(err.into()))
    }

    fn decide(&self, decision: RetryDecision) -> Result<()> {
        if self.state.retry_consumed.swap(true, Ordering::AcqRel) {
            return Err(RangeStreamError::Protocol {
                index: self.state.index,
            });
        }
        // The stream may already be gone; then nobody is waiting for the answer.
        self.state.s_decision.send(decision).ok();
        Ok(())
    }
}

/// Fetches `index`, giving the miss handler one chance to repair a failure.
pub(crate) async fn fetch_guarded(
    store: Arc<dyn ChunkStore>,
    index: ChunkIndex,
    on_miss: Option<Arc<MissHandler>>,
    miss_timeout: Option<Duration>,
) -> Result<Bytes> {
    let err = match store.get(index).await {
        Ok(chunk) => return Ok(chunk),
        Err(err) => err,
    };
    let Some(on_miss) = on_miss else {
        return Err(RangeStreamError::fetch(index, err));
    };

    warn!("chunk {index} missed: {err}");
    let (retry, mut r_decision) = Retry::new(index);
    on_miss(err, index, retry);

    let decision = match miss_timeout {
        Some(timeout) => tokio::time::timeout(timeout, r_decision.recv())
            .await
            .map_err(|_| RangeStreamError::MissTimeout { index, timeout })?,
        None => r_decision.recv().await,
    };

    match decision {
        Some(RetryDecision::Refetch) => {
            debug!("retrying chunk {index}");
            store
                .get(index)
                .await
                .map_err(|err| RangeStreamError::fetch(index, err))
        }
        Some(RetryDecision::Fail(err)) => Err(RangeStreamError::fetch(index, err)),
        None => Err(RangeStreamError::RetryAbandoned { index }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChunkStore;

    async fn store_missing_second_chunk() -> Arc<MemoryChunkStore> {
        Arc::new(MemoryChunkStore::from_bytes(b"abc", 3, Some(6)).await.unwrap())
    }

    #[test]
    fn test_retry_second_call_is_protocol_error() {
        let (retry, mut r_decision) = Retry::new(4);
        let clone = retry.clone();
        retry.retry().unwrap();
        assert!(clone.is_consumed());
        assert!(matches!(
            clone.fail("late"),
            Err(RangeStreamError::Protocol { index: 4 })
        ));
        assert!(matches!(r_decision.try_recv(), Ok(RetryDecision::Refetch)));
        assert!(r_decision.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fetch_without_handler_fails_once() {
        let store = store_missing_second_chunk().await;
        let res = fetch_guarded(store, 1, None, None).await;
        assert!(matches!(res, Err(RangeStreamError::Fetch { index: 1, .. })));
    }

    #[tokio::test]
    async fn test_refetch_failure_is_final() {
        let store = store_missing_second_chunk().await;
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler: Arc<MissHandler> = {
            let calls = calls.clone();
            Arc::new(move |_err: ChunkStoreError, _index: ChunkIndex, retry: Retry| {
                calls.fetch_add(1, Ordering::SeqCst);
                retry.retry().unwrap();
            })
        };
        let res = fetch_guarded(store, 1, Some(handler), None).await;
        assert!(matches!(res, Err(RangeStreamError::Fetch { index: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_retry_abandons_fetch() {
        let store = store_missing_second_chunk().await;
        let handler: Arc<MissHandler> =
            Arc::new(|_err: ChunkStoreError, _index: ChunkIndex, _retry: Retry| {});
        let res = fetch_guarded(store, 1, Some(handler), None).await;
        assert!(matches!(
            res,
            Err(RangeStreamError::RetryAbandoned { index: 1 })
        ));
    }

    #[tokio::test]
    async fn test_unanswered_miss_times_out() {
        let store = store_missing_second_chunk().await;
        let parked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handler: Arc<MissHandler> = {
            let parked = parked.clone();
            Arc::new(move |_err: ChunkStoreError, _index: ChunkIndex, retry: Retry| {
                parked.lock().unwrap().push(retry)
            })
        };
        let timeout = Duration::from_millis(20);
        let res = fetch_guarded(store, 1, Some(handler), Some(timeout)).await;
        assert!(matches!(
            res,
            Err(RangeStreamError::MissTimeout { index: 1, .. })
        ));
        assert_eq!(parked.lock().unwrap().len(), 1);
    }
}
