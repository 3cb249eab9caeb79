//! tus 1.0.0 client over HTTP.
//!
//! [`TusClient`] speaks the creation, offset and chunk requests of the
//! resumable upload protocol with `reqwest` and implements
//! [`UploadEndpoint`] so transfer sessions can drive it.

mod client;

pub use client::{TusClient, TusError};
