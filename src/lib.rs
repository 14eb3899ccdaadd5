//! Stream an arbitrary byte range out of a fixed-size chunk store.
//!
//! [`RangeStream`] turns linear byte offsets into chunk lookups, trims the
//! edge chunks and hands the bytes out in order. A miss handler can repair a
//! failed chunk fetch and retry it once before the stream gives up.

#[macro_use]
extern crate log;

pub mod error;
pub mod file_store;
mod http_utils;
pub mod memory;
pub mod miss;
pub mod pipe;
pub mod progress_reporter;
pub mod range_stream;
pub mod resource;
pub mod shared_types;
pub mod store;

pub use error::RangeStreamError;
pub use miss::{MissHandler, Retry};
pub use range_stream::{CloseReason, DestroyHandle, RangeOptions, RangeStream};
pub use store::{ChunkStore, ChunkStoreError};
