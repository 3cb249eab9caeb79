//! Byte sources that can be uploaded.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::TransferError;

/// Immutable description of the bytes being transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// MIME type, empty when unknown.
    pub mime_type: String,
    /// Last modification time in milliseconds since the Unix epoch.
    pub last_modified: i64,
}

/// Random-access source of the bytes of one file.
///
/// Reads are blocking; sessions call them from `spawn_blocking`.
pub trait ByteSource: Send + Sync {
    /// Returns the file description.
    fn info(&self) -> &FileInfo;

    /// Reads up to `len` bytes starting at `offset`.
    fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError>;
}

/// A file on the local disk.
pub struct FileSource {
    path: PathBuf,
    info: FileInfo,
}

impl FileSource {
    /// Opens `path` and captures its size, name and modification time.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let mime_type = detect_mime_type(&name).unwrap_or_default().to_string();

        Ok(Self {
            path: path.to_path_buf(),
            info: FileInfo {
                name,
                size: meta.len(),
                mime_type,
                last_modified,
            },
        })
    }
}

impl ByteSource for FileSource {
    fn info(&self) -> &FileInfo {
        &self.info
    }

    fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        if buf.len() < len && offset + (buf.len() as u64) < self.info.size {
            // The file shrank after it was queued.
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} changed while uploading", self.path.display()),
            )));
        }
        Ok(buf)
    }
}

/// In-memory bytes, for generated content and tests.
pub struct MemorySource {
    info: FileInfo,
    data: Vec<u8>,
}

impl MemorySource {
    /// Wraps `data` under the given name.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        let mime_type = detect_mime_type(&name).unwrap_or_default().to_string();
        Self {
            info: FileInfo {
                name,
                size: data.len() as u64,
                mime_type,
                last_modified: 0,
            },
            data,
        }
    }

    /// Overrides the modification timestamp used for fingerprinting.
    pub fn with_last_modified(mut self, millis: i64) -> Self {
        self.info.last_modified = millis;
        self
    }
}

impl ByteSource for MemorySource {
    fn info(&self) -> &FileInfo {
        &self.info
    }

    fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let start = std::cmp::min(offset, self.info.size) as usize;
        let end = std::cmp::min(start + len, self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

/// Guesses a MIME type from the file extension.
pub fn detect_mime_type(name: &str) -> Option<&'static str> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("txt" | "log") => Some("text/plain"),
        Some("json") => Some("application/json"),
        Some("yaml" | "yml") => Some("application/yaml"),
        Some("pdf") => Some("application/pdf"),
        Some("zip") => Some("application/zip"),
        Some("gz" | "tgz") => Some("application/gzip"),
        Some("tar") => Some("application/x-tar"),
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("gif") => Some("image/gif"),
        Some("mp4") => Some("video/mp4"),
        Some("sh") => Some("application/x-sh"),
        _ => None,
    }
}
