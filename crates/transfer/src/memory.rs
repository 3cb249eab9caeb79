//! In-process upload endpoint.
//!
//! Behaves like a resumable upload server that keeps everything in memory:
//! uploads only grow at their end, partial uploads can be concatenated, and
//! nothing is allocated before it arrives. Used for dry runs and to drive
//! sessions deterministically in tests: it can hold requests until released
//! and inject failures.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use dagflow_protocol::UploadMetadata;
use tokio::sync::Notify;
use tracing::trace;

use crate::TransferError;
use crate::endpoint::{BoxFuture, UploadEndpoint, UploadKind};

/// One chunk request seen by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub resource_url: String,
    pub offset: u64,
    pub len: usize,
    /// `false` when the request was failed by injection or validation.
    pub accepted: bool,
}

/// Kind of a stored upload, including the result of a concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKind {
    Whole,
    Partial,
    Final,
}

struct RemoteUpload {
    metadata: UploadMetadata,
    kind: StoredKind,
    length: u64,
    offset: u64,
    /// Received bytes; stays empty when contents are not kept.
    data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    uploads: HashMap<String, RemoteUpload>,
    patches: Vec<PatchRecord>,
    creates: usize,
    heads: usize,
    concats: usize,
    /// Chunk requests beyond this many are held until released.
    hold_after: Option<usize>,
    admitted: usize,
    /// Offset queries and creation requests wait while set.
    hold_setup: bool,
    fail_next: usize,
    fail_always: bool,
    fail_creates: usize,
    quota: Option<u64>,
}

/// Resumable upload endpoint backed by memory.
pub struct MemoryEndpoint {
    base_url: String,
    keep_contents: bool,
    inner: Mutex<Inner>,
    gate: Notify,
}

impl Default for MemoryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEndpoint {
    /// Creates an endpoint that keeps every received byte.
    pub fn new() -> Self {
        Self {
            base_url: "memory://uploads".into(),
            keep_contents: true,
            inner: Mutex::new(Inner::default()),
            gate: Notify::new(),
        }
    }

    /// Creates an endpoint that tracks offsets but drops the bytes.
    pub fn discarding() -> Self {
        Self {
            keep_contents: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Holds every chunk request after the first `n` until [`release`](Self::release).
    pub fn hold_after(&self, n: usize) {
        let mut inner = self.lock();
        inner.hold_after = Some(inner.admitted + n);
    }

    /// Holds offset queries and creation requests until [`release`](Self::release).
    pub fn hold_setup(&self) {
        self.lock().hold_setup = true;
    }

    /// Lets held and future requests through.
    pub fn release(&self) {
        {
            let mut inner = self.lock();
            inner.hold_after = None;
            inner.hold_setup = false;
        }
        self.gate.notify_waiters();
    }

    /// Fails the next `n` chunk requests with a transient network error.
    pub fn fail_next_patches(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Fails every chunk request with a transient network error.
    pub fn fail_all_patches(&self, enabled: bool) {
        self.lock().fail_always = enabled;
    }

    /// Fails the next `n` creation requests with a transient error.
    pub fn fail_next_creates(&self, n: usize) {
        self.lock().fail_creates = n;
    }

    /// Rejects chunks that would grow an upload past `bytes`.
    pub fn set_quota(&self, bytes: u64) {
        self.lock().quota = Some(bytes);
    }

    /// Forgets an upload, as a server-side expiry would.
    pub fn expire(&self, resource_url: &str) {
        self.lock().uploads.remove(resource_url);
    }

    /// Every chunk request seen so far.
    pub fn patch_log(&self) -> Vec<PatchRecord> {
        self.lock().patches.clone()
    }

    /// Accepted chunk requests only.
    pub fn accepted_patches(&self) -> Vec<PatchRecord> {
        self.lock()
            .patches
            .iter()
            .filter(|p| p.accepted)
            .cloned()
            .collect()
    }

    pub fn create_count(&self) -> usize {
        self.lock().creates
    }

    pub fn head_count(&self) -> usize {
        self.lock().heads
    }

    pub fn concat_count(&self) -> usize {
        self.lock().concats
    }

    /// Acknowledged offset of an upload.
    pub fn offset_of(&self, resource_url: &str) -> Option<u64> {
        self.lock().uploads.get(resource_url).map(|u| u.offset)
    }

    pub fn kind_of(&self, resource_url: &str) -> Option<StoredKind> {
        self.lock().uploads.get(resource_url).map(|u| u.kind)
    }

    /// Bytes received for an upload. Empty when contents are discarded.
    pub fn contents(&self, resource_url: &str) -> Option<Vec<u8>> {
        self.lock().uploads.get(resource_url).map(|u| u.data.clone())
    }

    /// Metadata an upload was created with.
    pub fn metadata_of(&self, resource_url: &str) -> Option<UploadMetadata> {
        self.lock()
            .uploads
            .get(resource_url)
            .map(|u| u.metadata.clone())
    }

    async fn wait_for_chunk_gate(&self) {
        loop {
            let notified = self.gate.notified();
            {
                let mut inner = self.lock();
                let held = inner.hold_after.is_some_and(|n| inner.admitted >= n);
                if !held {
                    inner.admitted += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    async fn wait_for_setup_gate(&self) {
        loop {
            let notified = self.gate.notified();
            if !self.lock().hold_setup {
                return;
            }
            notified.await;
        }
    }

    fn insert(inner: &mut Inner, base_url: &str, upload: RemoteUpload) -> String {
        inner.next_id += 1;
        let url = format!("{base_url}/{}", inner.next_id);
        inner.uploads.insert(url.clone(), upload);
        url
    }

    fn apply_patch(&self, url: &str, offset: u64, data: &[u8]) -> Result<u64, TransferError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut record = PatchRecord {
            resource_url: url.to_string(),
            offset,
            len: data.len(),
            accepted: false,
        };

        if inner.fail_always || inner.fail_next > 0 {
            inner.fail_next = inner.fail_next.saturating_sub(1);
            inner.patches.push(record);
            return Err(TransferError::Network("injected failure".into()));
        }

        let quota = inner.quota;
        let Some(upload) = inner.uploads.get_mut(url) else {
            inner.patches.push(record);
            return Err(TransferError::NotFound(url.to_string()));
        };

        let rejection = if upload.kind == StoredKind::Final {
            Some(TransferError::Rejected {
                status: 403,
                body: "concatenated uploads are read-only".into(),
            })
        } else if offset != upload.offset {
            Some(TransferError::OffsetMismatch {
                expected: offset,
                actual: upload.offset,
            })
        } else if offset + data.len() as u64 > upload.length {
            Some(TransferError::Rejected {
                status: 400,
                body: "chunk exceeds upload length".into(),
            })
        } else {
            None
        };
        if let Some(err) = rejection {
            inner.patches.push(record);
            return Err(err);
        }

        let end = offset + data.len() as u64;
        if let Some(limit) = quota
            && end > limit
        {
            inner.patches.push(record);
            return Err(TransferError::QuotaExceeded(format!(
                "upload would exceed {limit} bytes"
            )));
        }

        if self.keep_contents {
            upload.data.extend_from_slice(data);
        }
        upload.offset = end;
        trace!(url, offset, len = data.len(), "memory endpoint accepted chunk");
        record.accepted = true;
        inner.patches.push(record);
        Ok(end)
    }
}

impl UploadEndpoint for MemoryEndpoint {
    fn create<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        length: u64,
        kind: UploadKind,
    ) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move {
            self.lock().creates += 1;
            self.wait_for_setup_gate().await;

            let mut inner = self.lock();
            if inner.fail_creates > 0 {
                inner.fail_creates -= 1;
                return Err(TransferError::Server {
                    status: 503,
                    body: "injected failure".into(),
                });
            }

            let kind = match kind {
                UploadKind::Whole => StoredKind::Whole,
                UploadKind::Partial => StoredKind::Partial,
            };
            let upload = RemoteUpload {
                metadata: metadata.clone(),
                kind,
                length,
                offset: 0,
                data: Vec::new(),
            };
            Ok(Self::insert(&mut inner, &self.base_url, upload))
        })
    }

    fn concatenate<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        parts: &'a [String],
    ) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move {
            self.lock().concats += 1;
            self.wait_for_setup_gate().await;

            let mut inner = self.lock();
            let mut length = 0;
            let mut data = Vec::new();
            for url in parts {
                let Some(part) = inner.uploads.get(url) else {
                    return Err(TransferError::NotFound(url.clone()));
                };
                if part.kind != StoredKind::Partial || part.offset != part.length {
                    return Err(TransferError::Rejected {
                        status: 400,
                        body: format!("{url} is not a complete partial upload"),
                    });
                }
                length += part.length;
                data.extend_from_slice(&part.data);
            }
            for url in parts {
                inner.uploads.remove(url);
            }

            let upload = RemoteUpload {
                metadata: metadata.clone(),
                kind: StoredKind::Final,
                length,
                offset: length,
                data,
            };
            Ok(Self::insert(&mut inner, &self.base_url, upload))
        })
    }

    fn head<'a>(&'a self, resource_url: &'a str) -> BoxFuture<'a, Result<u64, TransferError>> {
        Box::pin(async move {
            self.lock().heads += 1;
            self.wait_for_setup_gate().await;
            self.offset_of(resource_url)
                .ok_or_else(|| TransferError::NotFound(resource_url.to_string()))
        })
    }

    fn patch<'a>(
        &'a self,
        resource_url: &'a str,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, TransferError>> {
        Box::pin(async move {
            self.wait_for_chunk_gate().await;
            self.apply_patch(resource_url, offset, data)
        })
    }
}
