use std::time::Duration;

use dagflow_protocol::constants::{
    CONCAT_FINAL_PREFIX, CONCAT_PARTIAL, CONTENT_TYPE_OFFSET_OCTET_STREAM, HEADER_REQUEST_ID,
    HEADER_TUS_RESUMABLE, HEADER_UPLOAD_CONCAT, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET,
};
use dagflow_protocol::{ProtocolError, TUS_VERSION, UploadMetadata};
use dagflow_transfer::{BoxFuture, TransferError, UploadEndpoint, UploadKind};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use tracing::{debug, trace};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const HEADER_LOCATION: &str = "Location";

/// Errors from the tus client.
#[derive(Debug, thiserror::Error)]
pub enum TusError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("offset mismatch: sent {expected}, server is at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("upload no longer exists: {0}")]
    Gone(String),

    #[error("response is missing the {0} header")]
    MissingHeader(&'static str),

    #[error("invalid {name} header: {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] ProtocolError),
}

impl From<TusError> for TransferError {
    fn from(err: TusError) -> Self {
        match err {
            TusError::Http(e) if e.is_builder() => TransferError::Protocol(e.to_string()),
            TusError::Http(e) => TransferError::Network(e.to_string()),
            TusError::Status { status, body } => match status {
                413 => TransferError::QuotaExceeded(body),
                423 | 500..=599 => TransferError::Server { status, body },
                _ => TransferError::Rejected { status, body },
            },
            TusError::OffsetMismatch { expected, actual } => {
                TransferError::OffsetMismatch { expected, actual }
            }
            TusError::Gone(url) => TransferError::NotFound(url),
            e @ (TusError::MissingHeader(_)
            | TusError::InvalidHeader { .. }
            | TusError::InvalidUrl(_)
            | TusError::Metadata(_)) => TransferError::Protocol(e.to_string()),
        }
    }
}

/// Client for one tus creation endpoint.
pub struct TusClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl TusClient {
    /// Creates a client for the creation endpoint at `endpoint`.
    pub fn new(endpoint: &str) -> Result<Self, TusError> {
        let endpoint = Url::parse(endpoint).map_err(|e| TusError::InvalidUrl(e.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// Starts a request carrying the protocol version and a fresh request id.
    fn request<U: reqwest::IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_REQUEST_ID, uuid::Uuid::new_v4().to_string())
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Starts a creation request for an upload of `length` bytes.
    fn creation(
        &self,
        metadata: &UploadMetadata,
        length: u64,
        kind: UploadKind,
    ) -> Result<RequestBuilder, TusError> {
        let req = self
            .request(Method::POST, self.endpoint.clone())
            .header(HEADER_UPLOAD_LENGTH, length.to_string())
            .header(HEADER_UPLOAD_METADATA, metadata.to_header()?);
        Ok(match kind {
            UploadKind::Whole => req,
            UploadKind::Partial => req.header(HEADER_UPLOAD_CONCAT, CONCAT_PARTIAL),
        })
    }

    /// Resolves the `Location` of a creation response against the endpoint.
    fn location(&self, resp: &Response) -> Result<String, TusError> {
        let location = header_str(resp, HEADER_LOCATION)?;
        let url = self
            .endpoint
            .join(location)
            .map_err(|e| TusError::InvalidUrl(format!("{location}: {e}")))?;
        Ok(url.into())
    }

    /// Creates a remote upload of `length` bytes and returns its absolute URL.
    pub async fn create_upload(
        &self,
        metadata: &UploadMetadata,
        length: u64,
        kind: UploadKind,
    ) -> Result<String, TusError> {
        let resp = self.creation(metadata, length, kind)?.send().await?;
        let resp = check_status(resp).await?;
        let url = self.location(&resp)?;
        debug!(url = %url, length, ?kind, "created upload");
        Ok(url)
    }

    /// Creates a remote upload and sends `data` in the same request.
    ///
    /// Returns the URL and the offset the server stored; a server that
    /// ignores the body answers without `Upload-Offset`, which reads as 0.
    pub async fn create_upload_with_data(
        &self,
        metadata: &UploadMetadata,
        length: u64,
        kind: UploadKind,
        data: &[u8],
    ) -> Result<(String, u64), TusError> {
        let resp = self
            .creation(metadata, length, kind)?
            .header(CONTENT_TYPE, CONTENT_TYPE_OFFSET_OCTET_STREAM)
            .body(data.to_vec())
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let url = self.location(&resp)?;
        let offset = if resp.headers().contains_key(HEADER_UPLOAD_OFFSET) {
            upload_offset(&resp)?
        } else {
            0
        };
        debug!(url = %url, length, offset, "created upload with data");
        Ok((url, offset))
    }

    /// Asks the server to join completed partial uploads, in order, into a
    /// final upload and returns its URL.
    pub async fn concatenate_uploads(
        &self,
        metadata: &UploadMetadata,
        parts: &[String],
    ) -> Result<String, TusError> {
        let resp = self
            .request(Method::POST, self.endpoint.clone())
            .header(
                HEADER_UPLOAD_CONCAT,
                format!("{CONCAT_FINAL_PREFIX}{}", parts.join(" ")),
            )
            .header(HEADER_UPLOAD_METADATA, metadata.to_header()?)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let url = self.location(&resp)?;
        debug!(url = %url, parts = parts.len(), "concatenated uploads");
        Ok(url)
    }

    /// Returns the offset the server has stored for `url`.
    pub async fn offset(&self, url: &str) -> Result<u64, TusError> {
        let resp = self
            .request(Method::HEAD, url)
            .send()
            .await?;
        if matches!(
            resp.status(),
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN
        ) {
            return Err(TusError::Gone(url.to_string()));
        }
        let resp = check_status(resp).await?;
        upload_offset(&resp)
    }

    /// Sends `data` at `offset` and returns the new server offset.
    ///
    /// A conflict is resolved into [`TusError::OffsetMismatch`] by asking the
    /// server where it actually is.
    pub async fn upload_chunk(&self, url: &str, offset: u64, data: &[u8]) -> Result<u64, TusError> {
        let resp = self
            .request(Method::PATCH, url)
            .header(CONTENT_TYPE, CONTENT_TYPE_OFFSET_OCTET_STREAM)
            .header(HEADER_UPLOAD_OFFSET, offset.to_string())
            .body(data.to_vec())
            .send()
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let actual = self.offset(url).await?;
            return Err(TusError::OffsetMismatch {
                expected: offset,
                actual,
            });
        }
        let resp = check_status(resp).await?;
        let acked = upload_offset(&resp)?;
        trace!(url, offset, len = data.len(), acked, "chunk stored");
        Ok(acked)
    }
}

impl UploadEndpoint for TusClient {
    fn create<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        length: u64,
        kind: UploadKind,
    ) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move { Ok(self.create_upload(metadata, length, kind).await?) })
    }

    fn create_with_data<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        length: u64,
        kind: UploadKind,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(String, u64), TransferError>> {
        Box::pin(async move {
            Ok(self
                .create_upload_with_data(metadata, length, kind, data)
                .await?)
        })
    }

    fn concatenate<'a>(
        &'a self,
        metadata: &'a UploadMetadata,
        parts: &'a [String],
    ) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move { Ok(self.concatenate_uploads(metadata, parts).await?) })
    }

    fn head<'a>(&'a self, resource_url: &'a str) -> BoxFuture<'a, Result<u64, TransferError>> {
        Box::pin(async move { Ok(self.offset(resource_url).await?) })
    }

    fn patch<'a>(
        &'a self,
        resource_url: &'a str,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, TransferError>> {
        Box::pin(async move { Ok(self.upload_chunk(resource_url, offset, data).await?) })
    }
}

/// Passes 2xx responses through; turns the rest into [`TusError::Status`].
async fn check_status(resp: Response) -> Result<Response, TusError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TusError::Status {
        status: status.as_u16(),
        body,
    })
}

fn header_str<'r>(resp: &'r Response, name: &'static str) -> Result<&'r str, TusError> {
    let value = resp
        .headers()
        .get(name)
        .ok_or(TusError::MissingHeader(name))?;
    value.to_str().map_err(|_| TusError::InvalidHeader {
        name,
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })
}

fn upload_offset(resp: &Response) -> Result<u64, TusError> {
    let raw = header_str(resp, HEADER_UPLOAD_OFFSET)?;
    raw.trim().parse().map_err(|_| TusError::InvalidHeader {
        name: HEADER_UPLOAD_OFFSET,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<String>>>;

    /// Reads one HTTP request, headers plus a `Content-Length` body.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Starts a mock server that answers successive connections with
    /// `responses` (status line and headers, no body) and records each
    /// request it receives.
    async fn mock_server(responses: Vec<&str>) -> (String, Captured, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let responses: Vec<String> = responses.into_iter().map(String::from).collect();

        let seen = Arc::clone(&captured);
        let handle = tokio::spawn(async move {
            for head in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                seen.lock().unwrap().push(request);

                let resp = format!("{head}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, captured, handle)
    }

    fn header<'a>(request: &'a str, name: &str) -> Option<&'a str> {
        request.lines().find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    #[tokio::test]
    async fn create_sends_metadata_and_resolves_location() {
        let (base, captured, handle) =
            mock_server(vec!["HTTP/1.1 201 Created\r\nLocation: /files/abc123"]).await;

        let client = TusClient::new(&format!("{base}/files/")).unwrap();
        let meta = UploadMetadata::new("report.pdf", "application/pdf", "task-1");
        let url = client
            .create_upload(&meta, 1024, UploadKind::Whole)
            .await
            .unwrap();
        assert_eq!(url, format!("{base}/files/abc123"));

        let requests = captured.lock().unwrap();
        let req = &requests[0];
        assert!(req.starts_with("POST /files/ HTTP/1.1"));
        assert_eq!(header(req, "tus-resumable"), Some("1.0.0"));
        assert_eq!(header(req, "upload-length"), Some("1024"));
        let sent = UploadMetadata::from_header(header(req, "upload-metadata").unwrap()).unwrap();
        assert_eq!(sent, meta);
        assert!(header(req, "x-request-id").is_some());
        assert!(header(req, "upload-concat").is_none());

        handle.abort();
    }

    #[tokio::test]
    async fn partial_creation_is_marked() {
        let (base, captured, handle) =
            mock_server(vec!["HTTP/1.1 201 Created\r\nLocation: /files/p1"]).await;
        let client = TusClient::new(&format!("{base}/files/")).unwrap();
        let url = client
            .create_upload(&UploadMetadata::for_part("task-1"), 512, UploadKind::Partial)
            .await
            .unwrap();
        assert_eq!(url, format!("{base}/files/p1"));

        let requests = captured.lock().unwrap();
        assert_eq!(header(&requests[0], "upload-concat"), Some("partial"));
        assert_eq!(header(&requests[0], "upload-length"), Some("512"));
        assert_eq!(header(&requests[0], "upload-metadata"), Some("task_id dGFzay0x"));
        handle.abort();
    }

    #[tokio::test]
    async fn concatenation_lists_parts_in_order() {
        let (base, captured, handle) =
            mock_server(vec!["HTTP/1.1 201 Created\r\nLocation: /files/final"]).await;
        let client = TusClient::new(&format!("{base}/files/")).unwrap();
        let parts = vec![format!("{base}/files/p1"), format!("{base}/files/p2")];
        let meta = UploadMetadata::new("a.bin", "", "task-1");
        let url = client.concatenate_uploads(&meta, &parts).await.unwrap();
        assert_eq!(url, format!("{base}/files/final"));

        let requests = captured.lock().unwrap();
        let req = &requests[0];
        assert!(req.starts_with("POST /files/ HTTP/1.1"));
        assert_eq!(
            header(req, "upload-concat"),
            Some(format!("final;{base}/files/p1 {base}/files/p2").as_str())
        );
        assert!(header(req, "upload-length").is_none());
        assert_eq!(
            UploadMetadata::from_header(header(req, "upload-metadata").unwrap()).unwrap(),
            meta
        );
        handle.abort();
    }

    #[tokio::test]
    async fn creation_carries_first_chunk() {
        let (base, captured, handle) = mock_server(vec![
            "HTTP/1.1 201 Created\r\nLocation: /files/c1\r\nUpload-Offset: 5",
            "HTTP/1.1 201 Created\r\nLocation: /files/c2",
        ])
        .await;
        let client = TusClient::new(&format!("{base}/files/")).unwrap();
        let meta = UploadMetadata::new("a.bin", "", "task-1");

        let (url, offset) = client
            .create_upload_with_data(&meta, 10, UploadKind::Whole, b"hello")
            .await
            .unwrap();
        assert_eq!(url, format!("{base}/files/c1"));
        assert_eq!(offset, 5);

        // A server without creation-with-upload stores nothing yet.
        let (_, offset) = client
            .create_upload_with_data(&meta, 10, UploadKind::Whole, b"hello")
            .await
            .unwrap();
        assert_eq!(offset, 0);

        let requests = captured.lock().unwrap();
        assert_eq!(
            header(&requests[0], "content-type"),
            Some("application/offset+octet-stream")
        );
        assert!(requests[0].ends_with("hello"));
        handle.abort();
    }

    #[tokio::test]
    async fn create_without_location_is_protocol_error() {
        let (base, _, handle) = mock_server(vec!["HTTP/1.1 201 Created"]).await;
        let client = TusClient::new(&base).unwrap();
        let err = client
            .create_upload(&UploadMetadata::new("a", "", "g"), 1, UploadKind::Whole)
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::MissingHeader("Location")));
        assert!(matches!(
            TransferError::from(err),
            TransferError::Protocol(_)
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn head_reads_offset() {
        let (base, captured, handle) =
            mock_server(vec!["HTTP/1.1 200 OK\r\nUpload-Offset: 4096"]).await;
        let client = TusClient::new(&base).unwrap();
        let offset = client.offset(&format!("{base}/files/x")).await.unwrap();
        assert_eq!(offset, 4096);
        assert!(captured.lock().unwrap()[0].starts_with("HEAD /files/x"));
        handle.abort();
    }

    #[tokio::test]
    async fn head_on_missing_upload_is_gone() {
        let (base, _, handle) = mock_server(vec!["HTTP/1.1 404 Not Found"]).await;
        let client = TusClient::new(&base).unwrap();
        let err = client.offset(&format!("{base}/files/x")).await.unwrap_err();
        assert!(matches!(err, TusError::Gone(_)));
        assert!(matches!(
            TransferError::from(err),
            TransferError::NotFound(_)
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn patch_sends_chunk_at_offset() {
        let (base, captured, handle) =
            mock_server(vec!["HTTP/1.1 204 No Content\r\nUpload-Offset: 10"]).await;
        let client = TusClient::new(&base).unwrap();
        let acked = client
            .upload_chunk(&format!("{base}/files/x"), 5, b"hello")
            .await
            .unwrap();
        assert_eq!(acked, 10);

        let requests = captured.lock().unwrap();
        let req = &requests[0];
        assert!(req.starts_with("PATCH /files/x"));
        assert_eq!(header(req, "upload-offset"), Some("5"));
        assert_eq!(
            header(req, "content-type"),
            Some("application/offset+octet-stream")
        );
        assert!(req.ends_with("hello"));
        handle.abort();
    }

    #[tokio::test]
    async fn conflict_reports_server_offset() {
        let (base, _, handle) = mock_server(vec![
            "HTTP/1.1 409 Conflict",
            "HTTP/1.1 200 OK\r\nUpload-Offset: 3",
        ])
        .await;
        let client = TusClient::new(&base).unwrap();
        let err = client
            .upload_chunk(&format!("{base}/files/x"), 5, b"hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TusError::OffsetMismatch {
                expected: 5,
                actual: 3
            }
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn endpoint_maps_statuses() {
        let (base, _, handle) = mock_server(vec![
            "HTTP/1.1 413 Payload Too Large",
            "HTTP/1.1 503 Service Unavailable",
            "HTTP/1.1 423 Locked",
            "HTTP/1.1 400 Bad Request",
        ])
        .await;
        let client = TusClient::new(&base).unwrap();
        let url = format!("{base}/files/x");

        let quota = client.patch(&url, 0, b"a").await.unwrap_err();
        assert!(matches!(quota, TransferError::QuotaExceeded(_)));
        assert!(!quota.is_retriable());

        let unavailable = client.patch(&url, 0, b"a").await.unwrap_err();
        assert!(unavailable.is_retriable());

        let locked = client.patch(&url, 0, b"a").await.unwrap_err();
        assert!(matches!(locked, TransferError::Server { status: 423, .. }));

        let rejected = client.patch(&url, 0, b"a").await.unwrap_err();
        assert!(matches!(rejected, TransferError::Rejected { status: 400, .. }));
        assert!(!rejected.is_retriable());

        handle.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_retriable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TusClient::new(&format!("http://127.0.0.1:{port}")).unwrap();
        let err = client
            .head(&format!("http://127.0.0.1:{port}/files/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn rejects_invalid_endpoint() {
        assert!(matches!(
            TusClient::new("not a url"),
            Err(TusError::InvalidUrl(_))
        ));
    }
}
