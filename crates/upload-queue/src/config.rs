use std::time::Duration;

use dagflow_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_PARALLEL_CHUNKS, RetryPolicy, SessionConfig};
use serde::{Deserialize, Serialize};

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Largest accepted chunk size: 1 GiB.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

const DEFAULT_GROUP_ID: &str = "default";
const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 5000];

/// Queue settings.
///
/// Out-of-range values are clamped, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Destination/grouping id attached to every upload.
    pub group_id: String,
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Chunk requests in flight per upload.
    pub parallel_chunks: usize,
    /// Send each upload's first chunk with its creation request.
    pub upload_data_during_creation: bool,
    /// Uploads running at once.
    pub concurrency_limit: usize,
    /// Delay before each attempt of a request, in milliseconds.
    pub retry_delays_ms: Vec<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_GROUP_ID.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel_chunks: DEFAULT_PARALLEL_CHUNKS,
            upload_data_during_creation: false,
            concurrency_limit: DEFAULT_CONCURRENCY,
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
        }
    }
}

impl QueueConfig {
    /// Returns the configuration with every value brought into range.
    pub fn clamped(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self.parallel_chunks = self.parallel_chunks.max(1);
        self.concurrency_limit = self.concurrency_limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        if self.retry_delays_ms.is_empty() {
            self.retry_delays_ms = vec![0];
        }
        self
    }

    /// Chunk size expressed in whole mebibytes, as used by the CLI.
    /// Clamped to `[1 MiB, MAX_CHUNK_SIZE]`.
    pub fn with_chunk_size_mb(mut self, mb: u64) -> Self {
        let bytes = mb.max(1).saturating_mul(MIB);
        self.chunk_size = usize::try_from(bytes)
            .unwrap_or(MAX_CHUNK_SIZE)
            .min(MAX_CHUNK_SIZE);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    /// Snapshot handed to a new transfer session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.group_id.clone())
            .with_chunk_size(self.chunk_size)
            .with_parallel_chunks(self.parallel_chunks)
            .with_upload_data_during_creation(self.upload_data_during_creation)
            .with_retry(self.retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.parallel_chunks, 6);
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn clamps_out_of_range_values() {
        let config = QueueConfig {
            group_id: "g".into(),
            chunk_size: 0,
            parallel_chunks: 0,
            upload_data_during_creation: false,
            concurrency_limit: 0,
            retry_delays_ms: Vec::new(),
        }
        .clamped();
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.parallel_chunks, 1);
        assert_eq!(config.concurrency_limit, MIN_CONCURRENCY);
        assert_eq!(config.retry_policy().attempts(), 1);

        let config = QueueConfig {
            concurrency_limit: 50,
            ..QueueConfig::default()
        }
        .clamped();
        assert_eq!(config.concurrency_limit, MAX_CONCURRENCY);

        let config = QueueConfig {
            chunk_size: usize::MAX,
            ..QueueConfig::default()
        }
        .clamped();
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn session_snapshot() {
        let config = QueueConfig {
            group_id: "task-9".into(),
            chunk_size: 1024,
            parallel_chunks: 2,
            upload_data_during_creation: true,
            ..QueueConfig::default()
        };
        let session = config.session_config();
        assert_eq!(session.group_id, "task-9");
        assert_eq!(session.chunk_size, 1024);
        assert_eq!(session.parallel_chunks, 2);
        assert!(session.upload_data_during_creation);
        assert_eq!(session.retry.attempts(), 4);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"group_id":"t","concurrency_limit":5}"#).unwrap();
        assert_eq!(config.group_id, "t");
        assert_eq!(config.concurrency_limit, 5);
        assert_eq!(config.parallel_chunks, DEFAULT_PARALLEL_CHUNKS);
    }

    #[test]
    fn chunk_size_from_mebibytes() {
        assert_eq!(QueueConfig::default().with_chunk_size_mb(2).chunk_size, 2 * 1024 * 1024);
        assert_eq!(QueueConfig::default().with_chunk_size_mb(0).chunk_size, 1024 * 1024);
    }

    #[test]
    fn huge_chunk_size_saturates() {
        assert_eq!(
            QueueConfig::default().with_chunk_size_mb(u64::MAX).chunk_size,
            MAX_CHUNK_SIZE
        );
        assert_eq!(
            QueueConfig::default().with_chunk_size_mb(4096).chunk_size,
            MAX_CHUNK_SIZE
        );
    }
}
