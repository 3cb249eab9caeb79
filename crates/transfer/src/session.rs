//! One resumable transfer of one file.
//!
//! A session survives any number of runs. Each [`TransferSession::start`]
//! spawns a run that resolves the remote uploads, sends the remaining
//! chunks and reports through a channel. Every remote upload only grows at
//! its end, so chunks of one upload go out strictly in order; with more
//! than one chunk in flight the file is split into partial uploads that
//! are sent side by side and concatenated once complete.
//! [`TransferSession::abort`] cancels the run and bumps the run id so
//! acknowledgements that race the abort are never applied.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dagflow_protocol::UploadMetadata;
use futures_util::future::try_join_all;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::TransferError;
use crate::chunked::{ChunkRange, PartRange, plan_chunks, plan_parts};
use crate::endpoint::{UploadEndpoint, UploadKind};
use crate::fingerprint::fingerprint;
use crate::progress::ThroughputMeter;
use crate::retry::retry;
use crate::source::ByteSource;
use crate::store::{FingerprintStore, StoredPart, StoredUpload};
use crate::types::{SessionConfig, SessionEvent, SessionEventKind};

/// One remote upload carrying a byte range of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePart {
    pub resource_url: String,
    pub range: PartRange,
    /// Bytes of the range the server has acknowledged.
    pub acked: u64,
}

/// Remote state an interrupted transfer can continue from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub parts: Vec<RemotePart>,
}

impl ResumePoint {
    /// Bytes acknowledged across every part.
    pub fn offset(&self) -> u64 {
        acknowledged(&self.parts)
    }

    /// URL of the upload when the file goes to a single one.
    pub fn resource_url(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [only] => Some(&only.resource_url),
            _ => None,
        }
    }
}

fn acknowledged(parts: &[RemotePart]) -> u64 {
    parts.iter().map(|p| p.acked).sum()
}

/// State shared between the session handle and its current run.
#[derive(Default)]
struct Shared {
    /// Id of the run allowed to commit. Bumped by every start and abort.
    run: u64,
    running: bool,
    parts: Vec<RemotePart>,
    resource_url: Option<String>,
    cancel: Option<CancellationToken>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resumable chunked upload of one [`ByteSource`].
pub struct TransferSession {
    owner: u64,
    fingerprint: String,
    source: Arc<dyn ByteSource>,
    endpoint: Arc<dyn UploadEndpoint>,
    store: Arc<dyn FingerprintStore>,
    config: SessionConfig,
    shared: Arc<Mutex<Shared>>,
}

impl TransferSession {
    /// Creates an idle session. `owner` tags every event it produces.
    pub fn new(
        owner: u64,
        source: Arc<dyn ByteSource>,
        endpoint: Arc<dyn UploadEndpoint>,
        store: Arc<dyn FingerprintStore>,
        config: SessionConfig,
    ) -> Self {
        let fingerprint = fingerprint(source.info(), &config.group_id);
        Self {
            owner,
            fingerprint,
            source,
            endpoint,
            store,
            config,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Bytes acknowledged by the remote end, summed over every part.
    pub fn remote_offset(&self) -> u64 {
        acknowledged(&lock(&self.shared).parts)
    }

    /// Remote upload URL: known once created or rediscovered for a single
    /// upload, and after concatenation for a split one.
    pub fn resource_url(&self) -> Option<String> {
        lock(&self.shared).resource_url.clone()
    }

    /// Returns `true` while a run is in progress.
    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    /// Id of the run whose events are current.
    pub fn current_run(&self) -> u64 {
        lock(&self.shared).run
    }

    /// Spawns a run that reports on `events` and returns its id.
    ///
    /// Starting a running session returns the id of the run in progress.
    pub fn start(&self, events: mpsc::Sender<SessionEvent>) -> u64 {
        let cancel = CancellationToken::new();
        let run = {
            let mut shared = lock(&self.shared);
            if shared.running {
                return shared.run;
            }
            shared.run += 1;
            shared.running = true;
            shared.cancel = Some(cancel.clone());
            shared.run
        };

        debug!(item = self.owner, run, "starting transfer run");
        let ctx = RunContext {
            owner: self.owner,
            run,
            fingerprint: self.fingerprint.clone(),
            source: Arc::clone(&self.source),
            endpoint: Arc::clone(&self.endpoint),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            cancel,
            events,
            meter: ThroughputMeter::start(),
        };
        tokio::spawn(ctx.run());
        run
    }

    /// Cancels the current run.
    ///
    /// Outstanding requests are dropped and nothing they acknowledge later
    /// is applied. The session stays resumable from its last committed
    /// offsets.
    pub fn abort(&self) {
        let cancel = {
            let mut shared = lock(&self.shared);
            shared.run += 1;
            shared.running = false;
            shared.cancel.take()
        };
        if let Some(cancel) = cancel {
            debug!(item = self.owner, "aborting transfer run");
            cancel.cancel();
        }
    }

    /// Looks for an earlier remote transfer of the same file in the store.
    ///
    /// Any failure is treated as "no prior session".
    pub async fn discover_prior_session(&self) -> Option<ResumePoint> {
        discover(
            self.endpoint.as_ref(),
            self.store.as_ref(),
            &self.fingerprint,
            self.source.info().size,
            self.owner,
        )
        .await
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Returns `true` when `parts` tile `[0, size)` in order.
fn covers(parts: &[StoredPart], size: u64) -> bool {
    let mut next = 0;
    for part in parts {
        if part.offset != next {
            return false;
        }
        next += part.len;
    }
    !parts.is_empty() && next == size
}

async fn discover(
    endpoint: &dyn UploadEndpoint,
    store: &dyn FingerprintStore,
    fingerprint: &str,
    size: u64,
    owner: u64,
) -> Option<ResumePoint> {
    let stored = match store.get(fingerprint) {
        Ok(Some(stored)) => stored,
        Ok(None) => return None,
        Err(e) => {
            warn!(item = owner, error = %e, "fingerprint lookup failed");
            return None;
        }
    };

    if stored.size != size || !covers(&stored.parts, size) {
        debug!(item = owner, "stored upload does not match the file, ignoring");
        return None;
    }

    let mut parts = Vec::with_capacity(stored.parts.len());
    for part in stored.parts {
        let queried = endpoint.head(&part.resource_url).await;
        match queried {
            Ok(acked) if acked <= part.len => parts.push(RemotePart {
                resource_url: part.resource_url,
                range: PartRange {
                    offset: part.offset,
                    len: part.len,
                },
                acked,
            }),
            Ok(acked) => {
                warn!(item = owner, acked, len = part.len, "stored upload is longer than its range");
                forget(store, fingerprint, owner);
                return None;
            }
            Err(e) => {
                debug!(item = owner, error = %e, "previous upload unavailable");
                if !e.is_retriable() {
                    forget(store, fingerprint, owner);
                }
                return None;
            }
        }
    }

    let point = ResumePoint { parts };
    info!(
        item = owner,
        parts = point.parts.len(),
        offset = point.offset(),
        "resuming previous upload"
    );
    Some(point)
}

fn forget(store: &dyn FingerprintStore, fingerprint: &str, owner: u64) {
    if let Err(e) = store.remove(fingerprint) {
        warn!(item = owner, error = %e, "failed to remove fingerprint");
    }
}

/// Everything one run needs, owned by its task.
struct RunContext {
    owner: u64,
    run: u64,
    fingerprint: String,
    source: Arc<dyn ByteSource>,
    endpoint: Arc<dyn UploadEndpoint>,
    store: Arc<dyn FingerprintStore>,
    config: SessionConfig,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    meter: ThroughputMeter,
}

impl RunContext {
    async fn run(self) {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.execute() => result,
        };

        let kind = match outcome {
            Ok(resource_url) => {
                forget(self.store.as_ref(), &self.fingerprint, self.owner);
                info!(item = self.owner, url = %resource_url, "upload complete");
                SessionEventKind::Success { resource_url }
            }
            Err(TransferError::Cancelled) => {
                debug!(item = self.owner, run = self.run, "transfer run cancelled");
                return;
            }
            Err(e) => {
                warn!(item = self.owner, error = %e, "upload failed");
                SessionEventKind::Error(e)
            }
        };

        if !self.finish() {
            return;
        }
        let _ = self
            .events
            .send(SessionEvent {
                owner: self.owner,
                run: self.run,
                kind,
            })
            .await;
    }

    async fn execute(&self) -> Result<String, TransferError> {
        let total = self.source.info().size;
        let parts = self.resolve_target().await?;
        self.adopt(&parts)?;

        let offset = acknowledged(&parts);
        let mut meter = self.meter.clone();
        meter.set_baseline(offset);
        self.emit_progress(offset, total, &meter).await;

        let window = self.config.parallel_chunks.max(1);
        let part_streams: Vec<_> = parts
            .iter()
            .enumerate()
            .map(|(index, part)| self.part_acks(index, part))
            .collect();
        let mut acks = stream::iter(part_streams).flatten_unordered(window);

        while let Some(ack) = acks.next().await {
            let (index, acked) = ack?;
            let offset = self.advance(index, acked)?;
            self.emit_progress(offset, total, &meter).await;
        }
        drop(acks);

        match parts.as_slice() {
            [only] => Ok(only.resource_url.clone()),
            _ => self.concatenate(&parts, total).await,
        }
    }

    /// Sends the rest of one part a chunk at a time, yielding the part's
    /// acknowledged offset after each chunk.
    fn part_acks<'s>(
        &'s self,
        index: usize,
        part: &RemotePart,
    ) -> BoxStream<'s, Result<(usize, u64), TransferError>> {
        let url = part.resource_url.clone();
        let base = part.range.offset;
        stream::iter(plan_chunks(part.acked, part.range.len, self.config.chunk_size))
            .then(move |range| {
                let url = url.clone();
                async move {
                    let acked = self.upload_chunk(&url, base, range).await?;
                    Ok::<_, TransferError>((index, acked))
                }
            })
            .boxed()
    }

    /// Finds the remote uploads to continue, or creates them.
    async fn resolve_target(&self) -> Result<Vec<RemotePart>, TransferError> {
        let known = lock(&self.shared).parts.clone();
        if !known.is_empty() {
            match self.query_parts(known).await {
                Ok(parts) => {
                    debug!(item = self.owner, offset = acknowledged(&parts), "remote offsets confirmed");
                    return Ok(parts);
                }
                Err(e @ (TransferError::NotFound(_) | TransferError::Rejected { .. })) => {
                    warn!(item = self.owner, error = %e, "remote upload gone, starting over");
                    forget(self.store.as_ref(), &self.fingerprint, self.owner);
                }
                Err(e) => return Err(e),
            }
        } else if let Some(found) = discover(
            self.endpoint.as_ref(),
            self.store.as_ref(),
            &self.fingerprint,
            self.source.info().size,
            self.owner,
        )
        .await
        {
            return Ok(found.parts);
        }

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.create_parts().await
    }

    /// Refreshes the acknowledged offset of every known part.
    async fn query_parts(&self, mut parts: Vec<RemotePart>) -> Result<Vec<RemotePart>, TransferError> {
        for part in &mut parts {
            let url = part.resource_url.clone();
            let offset = retry(&self.config.retry, "offset query", || self.endpoint.head(&url)).await?;
            if offset > part.range.len {
                return Err(TransferError::OffsetMismatch {
                    expected: part.range.len,
                    actual: offset,
                });
            }
            part.acked = offset;
        }
        Ok(parts)
    }

    fn file_metadata(&self) -> UploadMetadata {
        let info = self.source.info();
        UploadMetadata::new(
            info.name.clone(),
            info.mime_type.clone(),
            self.config.group_id.clone(),
        )
    }

    async fn create_parts(&self) -> Result<Vec<RemotePart>, TransferError> {
        let info = self.source.info();
        let plan = plan_parts(info.size, self.config.chunk_size, self.config.parallel_chunks);
        let (kind, metadata) = if plan.len() > 1 {
            (UploadKind::Partial, UploadMetadata::for_part(self.config.group_id.clone()))
        } else {
            (UploadKind::Whole, self.file_metadata())
        };

        let parts = try_join_all(
            plan.into_iter()
                .map(|range| self.create_part(&metadata, range, kind)),
        )
        .await?;
        info!(item = self.owner, parts = parts.len(), size = info.size, "created remote upload");

        let stored = StoredUpload {
            file_name: info.name.clone(),
            size: info.size,
            created_at: Utc::now(),
            parts: parts
                .iter()
                .map(|p| StoredPart {
                    resource_url: p.resource_url.clone(),
                    offset: p.range.offset,
                    len: p.range.len,
                })
                .collect(),
        };
        if let Err(e) = self.store.put(&self.fingerprint, stored) {
            warn!(item = self.owner, error = %e, "failed to record fingerprint, resume across restarts disabled");
        }
        Ok(parts)
    }

    async fn create_part(
        &self,
        metadata: &UploadMetadata,
        range: PartRange,
        kind: UploadKind,
    ) -> Result<RemotePart, TransferError> {
        let first = std::cmp::min(range.len, self.config.chunk_size as u64) as usize;
        let (resource_url, acked) = if self.config.upload_data_during_creation && first > 0 {
            let data = self.read(range.offset, first).await?;
            let bytes = data.as_slice();
            retry(&self.config.retry, "upload creation", || {
                self.endpoint.create_with_data(metadata, range.len, kind, bytes)
            })
            .await?
        } else {
            let url = retry(&self.config.retry, "upload creation", || {
                self.endpoint.create(metadata, range.len, kind)
            })
            .await?;
            (url, 0)
        };
        if acked > range.len {
            return Err(TransferError::OffsetMismatch {
                expected: range.len,
                actual: acked,
            });
        }
        debug!(item = self.owner, url = %resource_url, offset = range.offset, len = range.len, acked, "created upload part");
        Ok(RemotePart {
            resource_url,
            range,
            acked,
        })
    }

    async fn concatenate(&self, parts: &[RemotePart], total: u64) -> Result<String, TransferError> {
        let urls: Vec<String> = parts.iter().map(|p| p.resource_url.clone()).collect();
        let metadata = self.file_metadata();
        let url = retry(&self.config.retry, "upload concatenation", || {
            self.endpoint.concatenate(&metadata, &urls)
        })
        .await?;
        info!(item = self.owner, url = %url, parts = urls.len(), "concatenated partial uploads");
        self.commit_final(&url, total)?;
        Ok(url)
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let source = Arc::clone(&self.source);
        let data = tokio::task::spawn_blocking(move || source.read_chunk(offset, len))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        if data.len() != len {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {} of {len} bytes at offset {offset}", data.len()),
            )));
        }
        Ok(data)
    }

    /// Sends `range` of the part starting at file offset `base`. Offsets in
    /// `range` are relative to the part.
    async fn upload_chunk(&self, url: &str, base: u64, range: ChunkRange) -> Result<u64, TransferError> {
        let data = self.read(base + range.offset, range.len).await?;
        let endpoint = self.endpoint.as_ref();
        let bytes = data.as_slice();
        let acked = retry(&self.config.retry, "chunk upload", || {
            endpoint.patch(url, range.offset, bytes)
        })
        .await?;
        if acked != range.end() {
            return Err(TransferError::OffsetMismatch {
                expected: range.end(),
                actual: acked,
            });
        }
        trace!(item = self.owner, url, offset = range.offset, len = range.len, "chunk acknowledged");
        Ok(acked)
    }

    /// Records the resolved uploads while this run is current.
    fn adopt(&self, parts: &[RemotePart]) -> Result<(), TransferError> {
        let mut shared = lock(&self.shared);
        if shared.run != self.run {
            return Err(TransferError::Cancelled);
        }
        shared.parts = parts.to_vec();
        shared.resource_url = match parts {
            [only] => Some(only.resource_url.clone()),
            _ => None,
        };
        Ok(())
    }

    /// Moves a part's acknowledged offset forward while this run is
    /// current. Returns the bytes acknowledged over all parts.
    fn advance(&self, index: usize, acked: u64) -> Result<u64, TransferError> {
        let mut shared = lock(&self.shared);
        if shared.run != self.run {
            return Err(TransferError::Cancelled);
        }
        if let Some(part) = shared.parts.get_mut(index) {
            part.acked = part.acked.max(acked);
        }
        Ok(acknowledged(&shared.parts))
    }

    /// Replaces the parts with their concatenation, so a later run only
    /// has to confirm it.
    fn commit_final(&self, url: &str, total: u64) -> Result<(), TransferError> {
        let mut shared = lock(&self.shared);
        if shared.run != self.run {
            return Err(TransferError::Cancelled);
        }
        shared.parts = vec![RemotePart {
            resource_url: url.to_string(),
            range: PartRange {
                offset: 0,
                len: total,
            },
            acked: total,
        }];
        shared.resource_url = Some(url.to_string());
        Ok(())
    }

    /// Marks the run finished. Returns `false` when it was superseded.
    fn finish(&self) -> bool {
        let mut shared = lock(&self.shared);
        if shared.run != self.run {
            return false;
        }
        shared.running = false;
        shared.cancel = None;
        true
    }

    async fn emit_progress(&self, offset: u64, total: u64, meter: &ThroughputMeter) {
        let event = SessionEvent {
            owner: self.owner,
            run: self.run,
            kind: SessionEventKind::Progress {
                offset,
                total,
                bytes_per_second: meter.bytes_per_second(offset),
            },
        };
        let _ = self.events.send(event).await;
    }
}
