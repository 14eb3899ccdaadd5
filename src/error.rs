use std::time::Duration;

use thiserror::Error;

use crate::shared_types::ChunkIndex;
use crate::store::ChunkStoreError;

#[derive(Error, Debug)]
pub enum RangeStreamError {
    #[error("Invalid range stream configuration: {0}")]
    Configuration(String),

    #[error("Failed to fetch chunk {index}: {source}")]
    Fetch {
        index: ChunkIndex,
        #[source]
        source: ChunkStoreError,
    },

    #[error("Retry for chunk {index} cannot be called multiple times")]
    Protocol { index: ChunkIndex },

    #[error("Retry handle for chunk {index} was dropped without being used")]
    RetryAbandoned { index: ChunkIndex },

    #[error("Miss handler for chunk {index} did not answer within {timeout:?}")]
    MissTimeout {
        index: ChunkIndex,
        timeout: Duration,
    },

    #[error("Chunk {index} ended before the requested range")]
    ShortChunk { index: ChunkIndex },
}

impl RangeStreamError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RangeStreamError::Configuration(msg.into())
    }

    pub(crate) fn fetch(index: ChunkIndex, source: ChunkStoreError) -> Self {
        RangeStreamError::Fetch { index, source }
    }
}

pub type Result<T> = std::result::Result<T, RangeStreamError>;
