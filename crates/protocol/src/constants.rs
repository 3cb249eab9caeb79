/// Protocol version sent in every request.
pub const TUS_VERSION: &str = "1.0.0";

/// Request/response header carrying the protocol version.
pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";

/// Total size of the upload, sent on creation.
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";

/// Byte offset acknowledged by the server.
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";

/// Encoded key/value metadata attached on creation.
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";

/// Marks a creation request as a partial or final upload (concatenation
/// extension).
pub const HEADER_UPLOAD_CONCAT: &str = "Upload-Concat";

/// `Upload-Concat` value for a partial upload.
pub const CONCAT_PARTIAL: &str = "partial";

/// `Upload-Concat` prefix for the final upload; followed by the
/// space-separated partial upload URLs.
pub const CONCAT_FINAL_PREFIX: &str = "final;";

/// Per-request correlation id.
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";

/// Content type required for chunk bodies.
pub const CONTENT_TYPE_OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Metadata key for the original file name.
pub const META_FILENAME: &str = "filename";

/// Metadata key for the MIME type.
pub const META_FILETYPE: &str = "filetype";

/// Metadata key for the destination/grouping id.
///
/// The server rejects creation requests without it.
pub const META_GROUP_ID: &str = "task_id";
