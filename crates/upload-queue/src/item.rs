use std::fmt;
use std::sync::Arc;

use dagflow_transfer::{ByteSource, FileInfo, TransferSession};
use serde::Serialize;
use tracing::warn;

/// Lifecycle state of a queued upload.
///
/// Completion and removal delete the item rather than setting a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Waiting,
    Active,
    Paused,
    Error,
}

impl UploadStatus {
    /// Returns `true` if the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Active, Paused)
                | (Active, Error)
                | (Paused, Waiting)
                | (Paused, Active)
                | (Error, Waiting)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One file in the queue.
pub struct UploadItem {
    id: u64,
    source: Arc<dyn ByteSource>,
    status: UploadStatus,
    progress_percent: f64,
    bytes_per_second: Option<f64>,
    user_paused: bool,
    last_error: Option<String>,
    session: Option<TransferSession>,
}

impl UploadItem {
    pub fn new(id: u64, source: Arc<dyn ByteSource>) -> Self {
        Self {
            id,
            source,
            status: UploadStatus::Waiting,
            progress_percent: 0.0,
            bytes_per_second: None,
            user_paused: false,
            last_error: None,
            session: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &FileInfo {
        self.source.info()
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn progress_percent(&self) -> f64 {
        self.progress_percent
    }

    pub fn bytes_per_second(&self) -> Option<f64> {
        self.bytes_per_second
    }

    /// `true` when paused by the user rather than by the queue.
    pub fn user_paused(&self) -> bool {
        self.user_paused
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// Moves to `next` if the state machine allows it.
    pub(crate) fn transition(&mut self, next: UploadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(item = self.id, from = %self.status, to = %next, "invalid status transition ignored");
            return false;
        }
        self.status = next;
        if next != UploadStatus::Active {
            self.bytes_per_second = None;
        }
        true
    }

    pub(crate) fn set_user_paused(&mut self, paused: bool) {
        self.user_paused = paused;
    }

    pub(crate) fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    /// Applies progress from the running session. Progress never moves back.
    pub(crate) fn record_progress(&mut self, percent: f64, bytes_per_second: Option<f64>) {
        self.progress_percent = self.progress_percent.max(percent.clamp(0.0, 100.0));
        self.bytes_per_second = bytes_per_second;
    }

    pub(crate) fn session_or_insert_with(
        &mut self,
        create: impl FnOnce(Arc<dyn ByteSource>) -> TransferSession,
    ) -> &TransferSession {
        let source = Arc::clone(&self.source);
        self.session.get_or_insert_with(|| create(source))
    }

    /// Aborts the current run, keeping the session for a later resume.
    pub(crate) fn abort_session(&self) {
        if let Some(session) = &self.session {
            session.abort();
        }
    }

    pub(crate) fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.abort();
        }
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        let info = self.info();
        ItemSnapshot {
            id: self.id,
            name: info.name.clone(),
            size: info.size,
            status: self.status,
            progress_percent: self.progress_percent,
            bytes_per_second: self.bytes_per_second,
            user_paused: self.user_paused,
            last_error: self.last_error.clone(),
            resource_url: self.session.as_ref().and_then(|s| s.resource_url()),
        }
    }
}

/// Read-only view of an item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub status: UploadStatus,
    pub progress_percent: f64,
    pub bytes_per_second: Option<f64>,
    pub user_paused: bool,
    pub last_error: Option<String>,
    pub resource_url: Option<String>,
}
