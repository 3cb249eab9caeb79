//! Wire contract for the resumable upload protocol (tus 1.0.0, client role).
//!
//! Holds the header names and protocol constants shared by the HTTP client
//! and the transfer session, plus the `Upload-Metadata` codec.

pub mod constants;
pub mod metadata;

pub use constants::TUS_VERSION;
pub use metadata::{ProtocolError, UploadMetadata};
