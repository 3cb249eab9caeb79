//! Fixed-schedule retry for chunk and creation requests.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::TransferError;

/// Delays applied before each attempt of one request.
///
/// One attempt is made per entry: the default `[0, 1s, 3s, 5s]` means the
/// request is tried immediately, then after 1s, 3s and 5s, and the fourth
/// failure is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        }
    }
}

impl RetryPolicy {
    /// Creates a policy from explicit delays.
    ///
    /// An empty schedule still allows a single immediate attempt.
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self {
                delays: vec![Duration::ZERO],
            };
        }
        Self { delays }
    }

    /// Creates a policy from delays in milliseconds.
    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// Total number of attempts allowed.
    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    /// Delay before the given attempt (1-based). `None` once exhausted.
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        attempt
            .checked_sub(1)
            .and_then(|i| self.delays.get(i))
            .copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Runs `op` under `policy`.
///
/// Non-retriable errors are returned as-is on the attempt that produced
/// them; when every attempt fails with a retriable error the last one is
/// wrapped in [`TransferError::RetriesExhausted`].
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut last = None;
    for (i, delay) in policy.delays().iter().enumerate() {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => {
                warn!(attempt = i + 1, max = policy.attempts(), error = %e, "{what} failed");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(TransferError::RetriesExhausted {
        attempts: policy.attempts(),
        last: Box::new(last.unwrap_or_else(|| TransferError::Network("no attempt made".into()))),
    })
}
