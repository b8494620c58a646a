pub mod bounded;
pub mod conversation;
pub mod inbox;
pub mod vcs;

use devmon_core::{MonitorNotification, NewEvent, NotificationBus, StoredEvent};
use devmon_storage::{MonitorStore, StorageError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub use bounded::{BoundedCache, BoundedSeenSet};
pub use conversation::{
    ContentRecord, ConversationReconciler, ConversationRecord, MessageEnvelope,
    ReconcileReport, ReconcilerConfig,
};
pub use inbox::{InboxReport, SignalInbox};
pub use vcs::VcsPoller;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Root of the assistant client's per-record JSON files. `None` disables
    /// conversation capture.
    pub conversation_root: Option<PathBuf>,
    pub inbox_path: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    pub snapshot_window: Duration,
    pub watch_poll_interval: Duration,
    pub inbox_poll_interval: Duration,
    pub vcs_poll_interval: Duration,
    pub cache_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            conversation_root: None,
            inbox_path: None,
            workspace_root: None,
            snapshot_window: Duration::from_secs(5 * 60),
            watch_poll_interval: Duration::from_secs(2),
            inbox_poll_interval: Duration::from_secs(1),
            vcs_poll_interval: Duration::from_secs(10),
            cache_capacity: bounded::DEFAULT_CAPACITY,
        }
    }
}

/// Where canonical events go once reconciled: the store first, then the
/// notification stream.
#[derive(Clone)]
pub struct CaptureSink {
    store: Arc<MonitorStore>,
    bus: NotificationBus,
}

impl CaptureSink {
    pub fn new(store: Arc<MonitorStore>, bus: NotificationBus) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn try_record(&self, event: &NewEvent) -> Result<StoredEvent, CaptureError> {
        let stored = self.store.append_event(event)?;
        self.bus.publish(MonitorNotification::Capture {
            event: stored.clone(),
        });
        Ok(stored)
    }

    /// Store failures are reported on the bus and otherwise dropped.
    pub fn record(&self, event: &NewEvent) -> Option<StoredEvent> {
        match self.try_record(event) {
            Ok(stored) => Some(stored),
            Err(err) => {
                warn!("capture_store_failed: {err}");
                self.bus.error(format!("failed to store {} event: {err}", event.source));
                None
            }
        }
    }
}

/// Starts every configured capture source. Each task stops when `shutdown`
/// flips to `true`.
pub fn spawn_capture(
    config: &CaptureConfig,
    sink: CaptureSink,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if let Some(root) = config.conversation_root.clone() {
        let reconciler = ConversationReconciler::new(ReconcilerConfig {
            cache_capacity: config.cache_capacity,
            snapshot_window: config.snapshot_window,
        });
        let sink = sink.clone();
        let shutdown = shutdown.clone();
        let poll_interval = config.watch_poll_interval;
        handles.push(tokio::spawn(async move {
            let bus = sink.bus().clone();
            if let Err(err) =
                conversation::run_conversation_watch(root, poll_interval, reconciler, sink, shutdown)
                    .await
            {
                warn!("conversation_watch_failed: {err}");
                bus.error(format!("conversation capture stopped: {err}"));
            }
        }));
    }

    if let Some(path) = config.inbox_path.clone() {
        handles.push(tokio::spawn(inbox::run_inbox_watch(
            SignalInbox::new(path),
            config.snapshot_window,
            config.inbox_poll_interval,
            sink.clone(),
            shutdown.clone(),
        )));
    }

    if let Some(root) = config.workspace_root.clone() {
        handles.push(tokio::spawn(vcs::run_vcs_poll(
            VcsPoller::new(root),
            config.vcs_poll_interval,
            sink,
            shutdown,
        )));
    }

    handles
}
