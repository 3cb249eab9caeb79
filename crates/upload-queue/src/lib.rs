//! Upload queue: admission control over resumable transfer sessions.
//!
//! A [`QueueManager`] owns every queued item, admits at most
//! `concurrency_limit` of them at a time in FIFO order, and folds session
//! events into item state. Completed uploads move to the [`HistoryLog`].

mod admission;
mod config;
mod history;
mod item;
mod queue;

pub use admission::try_admit;
pub use config::{
    DEFAULT_CONCURRENCY, MAX_CHUNK_SIZE, MAX_CONCURRENCY, MIN_CONCURRENCY, QueueConfig,
};
pub use history::{HistoryEntry, HistoryLog};
pub use item::{ItemSnapshot, UploadItem, UploadStatus};
pub use queue::{QueueEvent, QueueManager, StatusCounts};

/// Errors produced by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown upload item {0}")]
    UnknownItem(u64),
}
