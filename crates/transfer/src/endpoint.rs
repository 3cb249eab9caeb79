//! Remote side of the resumable upload protocol.
//!
//! The HTTP client crate implements [`UploadEndpoint`] on top of
//! `reqwest`; [`crate::MemoryEndpoint`] implements it in-process. Using a
//! trait keeps sessions decoupled from transport and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use dagflow_protocol::UploadMetadata;

use crate::TransferError;

/// Boxed future returned by endpoint operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a creation request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// An upload carrying the whole file.
    Whole,
    /// One piece of a file, concatenated later.
    Partial,
}

/// Client role of the resumable upload protocol.
///
/// Every upload only grows at its end: a chunk sent at any offset other
/// than the one the server reports is rejected with
/// [`TransferError::OffsetMismatch`].
pub trait UploadEndpoint: Send + Sync {
    /// Begins a new remote upload of `length` bytes and returns its URL.
    fn create<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        length: u64,
        kind: UploadKind,
    ) -> BoxFuture<'a, Result<String, TransferError>>;

    /// Begins a new remote upload and sends `data` as its first chunk.
    ///
    /// Returns the URL and the offset the server acknowledged. The default
    /// issues a creation request followed by a chunk request.
    fn create_with_data<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        length: u64,
        kind: UploadKind,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(String, u64), TransferError>> {
        Box::pin(async move {
            let url = self.create(metadata, length, kind).await?;
            let offset = self.patch(&url, 0, data).await?;
            Ok((url, offset))
        })
    }

    /// Joins completed partial uploads, in order, into one upload and
    /// returns its URL.
    fn concatenate<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        parts: &'a [String],
    ) -> BoxFuture<'a, Result<String, TransferError>>;

    /// Returns the number of bytes the server has acknowledged.
    ///
    /// Fails with [`TransferError::NotFound`] when the upload is gone.
    fn head<'a>(&'a self, resource_url: &'a str) -> BoxFuture<'a, Result<u64, TransferError>>;

    /// Appends `data` at `offset` and returns the new server offset.
    fn patch<'a>(
        &'a self,
        resource_url: &'a str,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, TransferError>>;
}
