//! Resumable chunked transfer of a single file.
//!
//! A [`TransferSession`] moves one [`ByteSource`] to a remote
//! [`UploadEndpoint`] in fixed-size chunks, retries transient chunk
//! failures on a fixed delay schedule, and records a fingerprint in a
//! [`FingerprintStore`] so an interrupted transfer can be rediscovered
//! after a restart.

mod chunked;
mod endpoint;
mod fingerprint;
mod memory;
mod progress;
mod retry;
mod session;
mod source;
mod store;
mod types;

pub use chunked::{ChunkRange, PartRange, checksum_bytes, plan_chunks, plan_parts};
pub use endpoint::{BoxFuture, UploadEndpoint, UploadKind};
pub use fingerprint::fingerprint;
pub use memory::{MemoryEndpoint, PatchRecord, StoredKind};
pub use progress::{ThroughputMeter, percent};
pub use retry::{RetryPolicy, retry};
pub use session::{RemotePart, ResumePoint, TransferSession};
pub use source::{ByteSource, FileInfo, FileSource, MemorySource, detect_mime_type};
pub use store::{
    FingerprintStore, JsonFingerprintStore, MemoryFingerprintStore, StoreError, StoredPart,
    StoredUpload, app_config_dir, default_store_path,
};
pub use types::{SessionConfig, SessionEvent, SessionEventKind};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default number of chunks in flight per session. Above 1, a file larger
/// than one chunk is sent as that many partial uploads.
pub const DEFAULT_PARALLEL_CHUNKS: usize = 6;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("offset mismatch: expected {expected}, server reports {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<TransferError>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Returns `true` for failures worth another attempt on the same chunk.
    ///
    /// Offset mismatches, quota rejections and other client errors are
    /// final: retrying them would only repeat the same answer.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }
}
