use crate::retry::RetryPolicy;
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_PARALLEL_CHUNKS, TransferError};

/// Settings captured when a session is created.
///
/// A session keeps its snapshot for its whole lifetime; later changes to
/// the queue configuration only affect new sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Destination/grouping id sent in the upload metadata.
    pub group_id: String,
    pub chunk_size: usize,
    /// Chunk requests in flight at once. Above 1 the file is split into
    /// partial uploads, each sent strictly in order.
    pub parallel_chunks: usize,
    /// Send the first chunk of each upload in its creation request.
    pub upload_data_during_creation: bool,
    pub retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel_chunks: DEFAULT_PARALLEL_CHUNKS,
            upload_data_during_creation: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_parallel_chunks(mut self, parallel_chunks: usize) -> Self {
        self.parallel_chunks = parallel_chunks.max(1);
        self
    }

    pub fn with_upload_data_during_creation(mut self, enabled: bool) -> Self {
        self.upload_data_during_creation = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What a session run reports.
#[derive(Debug)]
pub enum SessionEventKind {
    /// The server acknowledged `offset` bytes of the file in total.
    Progress {
        offset: u64,
        total: u64,
        /// Average speed of this run, unknown until data has moved.
        bytes_per_second: Option<f64>,
    },
    /// Every byte is acknowledged.
    Success { resource_url: String },
    /// The run gave up.
    Error(TransferError),
}

/// An event from one run of a session.
///
/// `owner` identifies the session's holder (the queue item id) and `run`
/// the start() call that produced the event, so events from an aborted run
/// can be told apart from the current one.
#[derive(Debug)]
pub struct SessionEvent {
    pub owner: u64,
    pub run: u64,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    /// Returns `true` for success and error events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, SessionEventKind::Progress { .. })
    }
}
