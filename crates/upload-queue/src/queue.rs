//! Queue manager: owns the items, the slots and the session event channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dagflow_transfer::{
    ByteSource, FingerprintStore, SessionEvent, SessionEventKind, TransferSession, UploadEndpoint,
    percent,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::QueueError;
use crate::admission::try_admit;
use crate::config::QueueConfig;
use crate::history::{HistoryEntry, HistoryLog};
use crate::item::{ItemSnapshot, UploadItem, UploadStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the dispatcher applied.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Progress {
        id: u64,
        percent: f64,
        bytes_per_second: Option<f64>,
    },
    Completed {
        id: u64,
        file_name: String,
        resource_url: String,
    },
    Failed {
        id: u64,
        error: String,
    },
}

/// Number of items in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub waiting: usize,
    pub active: usize,
    pub paused: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.paused + self.error
    }
}

/// Concurrency-bounded queue of resumable uploads.
///
/// All state changes happen inside `&mut self` methods; session runs only
/// talk back through the event channel drained by [`next_event`](Self::next_event).
pub struct QueueManager {
    config: QueueConfig,
    endpoint: Arc<dyn UploadEndpoint>,
    store: Arc<dyn FingerprintStore>,
    items: BTreeMap<u64, UploadItem>,
    active: BTreeSet<u64>,
    global_paused: bool,
    history: HistoryLog,
    next_id: u64,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        endpoint: Arc<dyn UploadEndpoint>,
        store: Arc<dyn FingerprintStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: config.clamped(),
            endpoint,
            store,
            items: BTreeMap::new(),
            active: BTreeSet::new(),
            global_paused: false,
            history: HistoryLog::new(),
            next_id: 0,
            events_tx,
            events_rx,
        }
    }

    // ---- commands ----

    /// Adds a file to the queue and returns its id.
    pub fn enqueue(&mut self, source: Arc<dyn ByteSource>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        info!(item = id, name = %source.info().name, size = source.info().size, "queued upload");
        self.items.insert(id, UploadItem::new(id, source));
        self.reconcile();
        id
    }

    /// Starts a waiting item or resumes a paused one.
    ///
    /// A paused item only resumes when a slot is free and the queue is not
    /// globally paused; otherwise it stays paused but is no longer marked as
    /// paused by the user, so [`resume_all`](Self::resume_all) picks it up.
    pub fn start_or_resume(&mut self, id: u64) -> Result<(), QueueError> {
        let item = self.items.get_mut(&id).ok_or(QueueError::UnknownItem(id))?;
        match item.status() {
            UploadStatus::Waiting => self.reconcile(),
            UploadStatus::Paused => {
                item.set_user_paused(false);
                if self.global_paused || self.active.len() >= self.config.concurrency_limit {
                    warn!(
                        item = id,
                        active = self.active.len(),
                        limit = self.config.concurrency_limit,
                        "no free upload slot, item stays paused"
                    );
                    return Ok(());
                }
                self.activate(id);
            }
            UploadStatus::Active | UploadStatus::Error => {}
        }
        Ok(())
    }

    /// Re-queues a failed item.
    ///
    /// The failed session is discarded; the next run finds the bytes already
    /// on the server through the fingerprint store.
    pub fn restart(&mut self, id: u64) -> Result<(), QueueError> {
        let item = self.items.get_mut(&id).ok_or(QueueError::UnknownItem(id))?;
        if item.status() != UploadStatus::Error {
            return Ok(());
        }
        item.discard_session();
        item.set_last_error(None);
        item.transition(UploadStatus::Waiting);
        info!(item = id, "restarting failed upload");
        self.reconcile();
        Ok(())
    }

    /// Pauses an active item. Pausing anything else changes nothing.
    pub fn pause(&mut self, id: u64) -> Result<(), QueueError> {
        let item = self.items.get_mut(&id).ok_or(QueueError::UnknownItem(id))?;
        if item.status() != UploadStatus::Active {
            return Ok(());
        }
        item.set_user_paused(true);
        self.deactivate(id, UploadStatus::Paused);
        info!(item = id, "paused upload");
        self.reconcile();
        Ok(())
    }

    /// Drops an item, aborting its transfer if it is running.
    pub fn remove(&mut self, id: u64) -> Result<(), QueueError> {
        let mut item = self.items.remove(&id).ok_or(QueueError::UnknownItem(id))?;
        item.discard_session();
        self.active.remove(&id);
        info!(item = id, "removed upload");
        self.reconcile();
        Ok(())
    }

    /// Pauses the whole queue. Active items become system-paused.
    pub fn pause_all(&mut self) {
        self.global_paused = true;
        let running: Vec<u64> = self.active.iter().copied().collect();
        for id in running {
            let user_paused = self.items.get(&id).is_some_and(|item| item.user_paused());
            if !user_paused {
                self.deactivate(id, UploadStatus::Paused);
            }
        }
        info!("paused all uploads");
    }

    /// Lifts the global pause and admits waiting items.
    pub fn start_all(&mut self) {
        self.global_paused = false;
        self.reconcile();
    }

    /// Lifts the global pause and re-queues every system-paused item.
    ///
    /// Items paused by the user stay paused.
    pub fn resume_all(&mut self) {
        self.global_paused = false;
        for item in self.items.values_mut() {
            if item.status() == UploadStatus::Paused && !item.user_paused() {
                item.transition(UploadStatus::Waiting);
            }
        }
        info!("resuming all uploads");
        self.reconcile();
    }

    /// Aborts and forgets everything. Ids are never reused.
    pub fn clear_all(&mut self) {
        for item in self.items.values_mut() {
            item.discard_session();
        }
        self.items.clear();
        self.active.clear();
        self.global_paused = false;
        info!("cleared upload queue");
    }

    /// Replaces the configuration.
    ///
    /// Running sessions keep their chunk settings. Lowering the concurrency
    /// limit below the number of active items system-pauses the newest ones.
    pub fn update_config(&mut self, config: QueueConfig) {
        self.config = config.clamped();
        debug!(limit = self.config.concurrency_limit, "queue configuration updated");
        self.reconcile();
    }

    // ---- dispatcher ----

    /// Waits for the next session event and applies it.
    ///
    /// Returns `None` once no item is active.
    pub async fn next_event(&mut self) -> Option<QueueEvent> {
        loop {
            if self.active.is_empty() {
                return None;
            }
            let event = self.events_rx.recv().await?;
            if let Some(applied) = self.apply(event) {
                return Some(applied);
            }
        }
    }

    /// Drives the dispatcher until no item is active.
    pub async fn run_until_idle(&mut self) {
        while self.next_event().await.is_some() {}
    }

    fn apply(&mut self, event: SessionEvent) -> Option<QueueEvent> {
        let id = event.owner;
        let Some(item) = self.items.get_mut(&id) else {
            trace!(item = id, "event for removed item dropped");
            return None;
        };
        let current = item.session().map(|s| s.current_run());
        if item.status() != UploadStatus::Active || current != Some(event.run) {
            trace!(item = id, run = event.run, "stale event dropped");
            return None;
        }

        match event.kind {
            SessionEventKind::Progress {
                offset,
                total,
                bytes_per_second,
            } => {
                item.record_progress(percent(offset, total), bytes_per_second);
                Some(QueueEvent::Progress {
                    id,
                    percent: item.progress_percent(),
                    bytes_per_second,
                })
            }
            SessionEventKind::Success { resource_url } => {
                let item = self.items.remove(&id)?;
                self.active.remove(&id);
                let info = item.info();
                self.history
                    .record(HistoryEntry::now(info.name.clone(), info.size, resource_url.clone()));
                info!(item = id, name = %info.name, url = %resource_url, "upload finished");
                let file_name = info.name.clone();
                self.reconcile();
                Some(QueueEvent::Completed {
                    id,
                    file_name,
                    resource_url,
                })
            }
            SessionEventKind::Error(e) => {
                let error = e.to_string();
                item.set_last_error(Some(error.clone()));
                self.deactivate(id, UploadStatus::Error);
                warn!(item = id, error = %error, "upload failed");
                self.reconcile();
                Some(QueueEvent::Failed { id, error })
            }
        }
    }

    // ---- slots ----

    /// Evicts over-limit active items, then fills free slots in FIFO order.
    fn reconcile(&mut self) {
        let limit = self.config.concurrency_limit;
        while self.active.len() > limit {
            let Some(&newest) = self.active.last() else {
                break;
            };
            info!(item = newest, limit, "over capacity, pausing newest upload");
            self.deactivate(newest, UploadStatus::Paused);
        }

        let admitted = try_admit(self.items.values(), self.active.len(), limit, self.global_paused);
        for id in admitted {
            self.activate(id);
        }
    }

    fn activate(&mut self, id: u64) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if !item.transition(UploadStatus::Active) {
            return;
        }

        let endpoint = Arc::clone(&self.endpoint);
        let store = Arc::clone(&self.store);
        let session_config = self.config.session_config();
        let session = item.session_or_insert_with(|source| {
            TransferSession::new(id, source, endpoint, store, session_config)
        });
        let run = session.start(self.events_tx.clone());
        self.active.insert(id);
        debug!(item = id, run, active = self.active.len(), "upload admitted");
    }

    fn deactivate(&mut self, id: u64, status: UploadStatus) {
        self.active.remove(&id);
        if let Some(item) = self.items.get_mut(&id) {
            item.abort_session();
            item.transition(status);
        }
    }

    // ---- queries ----

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn get(&self, id: u64) -> Option<ItemSnapshot> {
        self.items.get(&id).map(UploadItem::snapshot)
    }

    /// Snapshots of every item in queue order.
    pub fn items(&self) -> Vec<ItemSnapshot> {
        self.items.values().map(UploadItem::snapshot).collect()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for item in self.items.values() {
            match item.status() {
                UploadStatus::Waiting => counts.waiting += 1,
                UploadStatus::Active => counts.active += 1,
                UploadStatus::Paused => counts.paused += 1,
                UploadStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Progress across all queued items, weighted by size.
    pub fn total_progress(&self) -> f64 {
        let (done, total) = self.items.values().fold((0.0, 0u64), |(done, total), item| {
            let size = item.info().size;
            (done + size as f64 * item.progress_percent() / 100.0, total + size)
        });
        if total == 0 {
            return 0.0;
        }
        percent(done.round() as u64, total)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_paused(&self) -> bool {
        self.global_paused
    }

    /// `true` when nothing is uploading.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }
}
