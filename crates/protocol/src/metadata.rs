//! `Upload-Metadata` header codec.
//!
//! The header is a comma-separated list of `key base64(value)` pairs.
//! Keys must be non-empty and contain neither spaces nor commas.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::constants::{META_FILENAME, META_FILETYPE, META_GROUP_ID};

/// Errors produced while encoding or decoding metadata.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),

    #[error("invalid base64 in metadata value for {key}: {source}")]
    InvalidValue {
        key: String,
        source: base64::DecodeError,
    },

    #[error("metadata value for {0} is not UTF-8")]
    NotUtf8(String),
}

/// Metadata attached to a remote upload at creation time.
///
/// Immutable for the lifetime of the remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub filename: String,
    pub filetype: String,
    pub group_id: String,
}

impl UploadMetadata {
    /// Builds metadata for a file bound to a destination group.
    pub fn new(
        filename: impl Into<String>,
        filetype: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            filetype: filetype.into(),
            group_id: group_id.into(),
        }
    }

    /// Metadata for one partial upload of a file: only the group id.
    pub fn for_part(group_id: impl Into<String>) -> Self {
        Self::new("", "", group_id)
    }

    /// Returns the metadata as ordered key/value pairs.
    ///
    /// An empty `filename` or `filetype` is omitted, matching what browsers
    /// send for files of unknown type and for partial uploads.
    pub fn pairs(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if !self.filename.is_empty() {
            map.insert(META_FILENAME.to_string(), self.filename.clone());
        }
        if !self.filetype.is_empty() {
            map.insert(META_FILETYPE.to_string(), self.filetype.clone());
        }
        map.insert(META_GROUP_ID.to_string(), self.group_id.clone());
        map
    }

    /// Encodes the metadata as an `Upload-Metadata` header value.
    pub fn to_header(&self) -> Result<String, ProtocolError> {
        encode_pairs(&self.pairs())
    }

    /// Parses an `Upload-Metadata` header value.
    ///
    /// Missing keys decode to empty strings; unknown keys are ignored.
    pub fn from_header(header: &str) -> Result<Self, ProtocolError> {
        let mut pairs = decode_pairs(header)?;
        Ok(Self {
            filename: pairs.remove(META_FILENAME).unwrap_or_default(),
            filetype: pairs.remove(META_FILETYPE).unwrap_or_default(),
            group_id: pairs.remove(META_GROUP_ID).unwrap_or_default(),
        })
    }
}

/// Encodes arbitrary key/value pairs into header form.
pub fn encode_pairs(pairs: &BTreeMap<String, String>) -> Result<String, ProtocolError> {
    let mut parts = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        validate_key(key)?;
        if value.is_empty() {
            parts.push(key.clone());
        } else {
            parts.push(format!("{key} {}", STANDARD.encode(value.as_bytes())));
        }
    }
    Ok(parts.join(","))
}

/// Decodes a header value into key/value pairs.
pub fn decode_pairs(header: &str) -> Result<BTreeMap<String, String>, ProtocolError> {
    let mut map = BTreeMap::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, encoded) = match part.split_once(' ') {
            Some((k, v)) => (k, v.trim()),
            None => (part, ""),
        };
        validate_key(key)?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|source| ProtocolError::InvalidValue {
                key: key.to_string(),
                source,
            })?;
        let value = String::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8(key.to_string()))?;
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn validate_key(key: &str) -> Result<(), ProtocolError> {
    if key.is_empty() || key.contains(' ') || key.contains(',') {
        return Err(ProtocolError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_contains_base64_values() {
        let meta = UploadMetadata::new("report.pdf", "application/pdf", "task-1");
        let header = meta.to_header().unwrap();
        assert!(header.contains("filename cmVwb3J0LnBkZg=="));
        assert!(header.contains("task_id dGFzay0x"));
        assert!(header.contains("filetype "));
    }

    #[test]
    fn empty_filetype_is_omitted() {
        let meta = UploadMetadata::new("blob", "", "g");
        let header = meta.to_header().unwrap();
        assert!(!header.contains("filetype"));
        let parsed = UploadMetadata::from_header(&header).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn part_metadata_carries_only_group() {
        let meta = UploadMetadata::for_part("task-3");
        assert_eq!(meta.to_header().unwrap(), "task_id dGFzay0z");
        assert_eq!(UploadMetadata::from_header("task_id dGFzay0z").unwrap(), meta);
    }

    #[test]
    fn parses_non_ascii_names() {
        let meta = UploadMetadata::new("数据 备份.tar.gz", "application/gzip", "task-9");
        let parsed = UploadMetadata::from_header(&meta.to_header().unwrap()).unwrap();
        assert_eq!(parsed.filename, "数据 备份.tar.gz");
    }

    #[test]
    fn key_without_value_decodes_empty() {
        let pairs = decode_pairs("is_confidential,filename d29ybGQ=").unwrap();
        assert_eq!(pairs["is_confidential"], "");
        assert_eq!(pairs["filename"], "world");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = decode_pairs("filename !!!").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValue { .. }));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let mut pairs = BTreeMap::new();
        pairs.insert("bad,key".to_string(), "v".to_string());
        assert!(matches!(
            encode_pairs(&pairs),
            Err(ProtocolError::InvalidKey(_))
        ));
    }
}
